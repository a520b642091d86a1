use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    routing::post,
    Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use serde_json::{json, Value};
use tracing::instrument;

use super::{
    cookies::{clear_session, set_session, REFRESH_COOKIE},
    dto::{
        AuthResponse, ChangePasswordRequest, LoginRequest, RefreshRequest, RegisterInput,
        TokensResponse,
    },
    extractors::AuthUser,
    services,
};
use crate::{
    error::ApiError, images::services::stage_field, response::ApiResponse, state::AppState,
    users::repo_types::PublicUser,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/register",
            post(register).layer(DefaultBodyLimit::max(20 * 1024 * 1024)), // 20MB
        )
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route("/refresh-token", post(refresh_token))
        .route("/change-password", post(change_password))
}

/// POST /register (multipart)
/// Text fields: username, email, fullName, password. Files: avatar (required), coverImage.
#[instrument(skip_all)]
pub async fn register(
    State(state): State<AppState>,
    mut mp: Multipart,
) -> Result<ApiResponse<PublicUser>, ApiError> {
    let mut input = RegisterInput::default();
    while let Some(field) = mp.next_field().await? {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("username") => input.username = field.text().await?,
            Some("email") => input.email = field.text().await?,
            Some("fullName") => input.full_name = field.text().await?,
            Some("password") => input.password = field.text().await?,
            Some("avatar") if input.avatar.is_none() => {
                input.avatar = stage_field(&state, field).await?
            }
            Some("coverImage") if input.cover_image.is_none() => {
                input.cover_image = stage_field(&state, field).await?
            }
            _ => {}
        }
    }

    let user = services::register(&state, input).await?;
    Ok(ApiResponse::new(
        StatusCode::CREATED,
        user,
        "User registered successfully",
    ))
}

#[instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    jar: CookieJar,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<(CookieJar, ApiResponse<AuthResponse>), ApiError> {
    let Json(payload) = payload?;
    let (user, tokens) = services::login(&state, payload).await?;
    let jar = set_session(jar, &tokens, state.config.cookie_secure);
    Ok((
        jar,
        ApiResponse::ok(
            AuthResponse {
                user,
                access_token: tokens.access_token,
                refresh_token: tokens.refresh_token,
            },
            "User logged in successfully",
        ),
    ))
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn logout(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    jar: CookieJar,
) -> Result<(CookieJar, ApiResponse<Value>), ApiError> {
    services::logout(&state, user.id).await?;
    let jar = clear_session(jar, state.config.cookie_secure);
    Ok((jar, ApiResponse::ok(json!({}), "User logged out")))
}

#[instrument(skip_all)]
pub async fn refresh_token(
    State(state): State<AppState>,
    jar: CookieJar,
    payload: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<(CookieJar, ApiResponse<TokensResponse>), ApiError> {
    let incoming = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| payload.ok().and_then(|Json(body)| body.refresh_token));

    let tokens = services::refresh(&state, incoming).await?;
    let jar = set_session(jar, &tokens, state.config.cookie_secure);
    Ok((
        jar,
        ApiResponse::ok(TokensResponse::from(tokens), "Access token refreshed"),
    ))
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn change_password(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    payload: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<ApiResponse<Value>, ApiError> {
    let Json(payload) = payload?;
    services::change_password(&state, user.id, payload).await?;
    Ok(ApiResponse::ok(json!({}), "Password changed successfully"))
}
