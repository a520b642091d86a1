use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{header::AUTHORIZATION, request::Parts},
};
use axum_extra::extract::cookie::CookieJar;
use tracing::warn;

use super::{cookies::ACCESS_COOKIE, jwt::JwtKeys};
use crate::{error::ApiError, state::AppState, users::repo_types::PublicUser};

/// The authenticated caller, resolved from a valid access token.
///
/// Only the signature and expiry of the access token are checked; the stored
/// refresh token is not consulted, so an access token stays usable after
/// logout until it expires.
#[derive(Debug, Clone)]
pub struct AuthUser(pub PublicUser);

/// Access token from the `accessToken` cookie, else from `Authorization: Bearer`.
fn access_token(parts: &Parts) -> Option<String> {
    let jar = CookieJar::from_headers(&parts.headers);
    if let Some(c) = jar.get(ACCESS_COOKIE).filter(|c| !c.value().is_empty()) {
        return Some(c.value().to_string());
    }
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token =
            access_token(parts).ok_or_else(|| ApiError::unauthorized("Unauthorized request"))?;

        let claims = JwtKeys::from_ref(state).verify_access(&token).map_err(|e| {
            warn!(error = %e, "invalid or expired access token");
            ApiError::unauthorized("Invalid or expired access token")
        })?;

        let user = state
            .users
            .find_by_id(claims.sub)
            .await?
            .ok_or_else(|| {
                warn!(user_id = %claims.sub, "access token for unknown user");
                ApiError::unauthorized("Invalid access token")
            })?;

        Ok(AuthUser(user.into()))
    }
}
