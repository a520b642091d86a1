//! Session flows: registration, login, logout, refresh and password change.
//!
//! A user holds at most one live refresh token, stored on the user record.
//! Login overwrites it, refresh rotates it, logout clears it. A refresh token
//! is honoured only while it is the stored one.

use axum::extract::FromRef;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::{
    dto::{ChangePasswordRequest, LoginRequest, RegisterInput},
    jwt::{JwtKeys, TokenPair},
    password::{hash_password, verify_password},
};
use crate::{
    error::ApiError,
    images::services::{remove_from_media_store, upload_on_media_store},
    state::AppState,
    users::{
        repo::is_unique_violation,
        repo_types::{NewUser, ProfileImage, PublicUser},
        services::normalize_email,
    },
};

const STALE_REFRESH: &str = "Refresh token is expired or used";

fn non_empty(value: Option<String>, lowercase: bool) -> Option<String> {
    value
        .map(|v| {
            let v = v.trim();
            if lowercase {
                v.to_lowercase()
            } else {
                v.to_string()
            }
        })
        .filter(|v| !v.is_empty())
}

#[instrument(skip_all, fields(username = %input.username.trim()))]
pub async fn register(st: &AppState, input: RegisterInput) -> Result<PublicUser, ApiError> {
    let RegisterInput {
        username,
        email,
        full_name,
        password,
        avatar,
        cover_image,
    } = input;

    if [&username, &email, &full_name, &password]
        .iter()
        .any(|f| f.trim().is_empty())
    {
        return Err(ApiError::validation("All fields are required"));
    }
    let username = username.trim().to_lowercase();
    let email = normalize_email(&email)?;
    let full_name = full_name.trim().to_string();

    if st
        .users
        .find_by_username_or_email(Some(&username), Some(&email))
        .await?
        .is_some()
    {
        warn!(%username, %email, "username or email already registered");
        return Err(ApiError::Conflict(
            "User with email or username already exists".into(),
        ));
    }

    if avatar.is_none() {
        return Err(ApiError::validation("Avatar file is required"));
    }
    let avatar = upload_on_media_store(st, avatar, ProfileImage::Avatar)
        .await
        .ok_or_else(|| ApiError::validation("Avatar file is required"))?;
    let cover_image = upload_on_media_store(st, cover_image, ProfileImage::CoverImage).await;

    let uploaded: Vec<String> = std::iter::once(avatar.clone())
        .chain(cover_image.clone())
        .collect();
    let created = match hash_password(&password) {
        Ok(password_hash) => {
            st.users
                .create(NewUser {
                    username,
                    email,
                    full_name,
                    avatar,
                    cover_image,
                    password_hash,
                })
                .await
        }
        Err(e) => Err(e),
    };
    let created = match created {
        Ok(user) => user,
        Err(e) => {
            // No record points at the uploads any more.
            for url in &uploaded {
                remove_from_media_store(st, url).await;
            }
            return Err(if is_unique_violation(&e) {
                ApiError::Conflict("User with email or username already exists".into())
            } else {
                e.into()
            });
        }
    };

    let user = st.users.find_by_id(created.id).await?.ok_or_else(|| {
        ApiError::Internal("Something went wrong while registering the user".into())
    })?;

    info!(user_id = %user.id, "user registered");
    Ok(user.into())
}

#[instrument(skip_all)]
pub async fn login(
    st: &AppState,
    req: LoginRequest,
) -> Result<(PublicUser, TokenPair), ApiError> {
    let username = non_empty(req.username, true);
    let email = non_empty(req.email, true);
    if username.is_none() && email.is_none() {
        return Err(ApiError::validation("username or email is required"));
    }

    let user = st
        .users
        .find_by_username_or_email(username.as_deref(), email.as_deref())
        .await?
        .ok_or_else(|| ApiError::NotFound("User does not exist".into()))?;

    if !verify_password(&req.password, &user.password_hash)? {
        warn!(user_id = %user.id, "login invalid password");
        return Err(ApiError::unauthorized("Invalid user credentials"));
    }

    let tokens = JwtKeys::from_ref(st).sign_pair(user.id)?;
    st.users
        .set_refresh_token(user.id, Some(&tokens.refresh_token))
        .await?;

    info!(user_id = %user.id, "user logged in");
    Ok((user.into(), tokens))
}

#[instrument(skip(st))]
pub async fn logout(st: &AppState, user_id: Uuid) -> Result<(), ApiError> {
    st.users.set_refresh_token(user_id, None).await?;
    info!(%user_id, "user logged out");
    Ok(())
}

/// Exchanges the stored refresh token for a new pair. The presented token
/// stops working once this succeeds.
#[instrument(skip_all)]
pub async fn refresh(st: &AppState, incoming: Option<String>) -> Result<TokenPair, ApiError> {
    let incoming = non_empty(incoming, false)
        .ok_or_else(|| ApiError::unauthorized("Unauthorized request"))?;

    let keys = JwtKeys::from_ref(st);
    let claims = keys.verify_refresh(&incoming).map_err(|e| {
        warn!(error = %e, "refresh token rejected");
        ApiError::unauthorized("Invalid refresh token")
    })?;

    let user = st
        .users
        .find_by_id(claims.sub)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid refresh token"))?;

    if user.refresh_token.as_deref() != Some(incoming.as_str()) {
        warn!(user_id = %user.id, "refresh token does not match stored token");
        return Err(ApiError::unauthorized(STALE_REFRESH));
    }

    let tokens = keys.sign_pair(user.id)?;
    // Concurrent refreshes with the same token: only one swap wins.
    if !st
        .users
        .swap_refresh_token(user.id, &incoming, &tokens.refresh_token)
        .await?
    {
        warn!(user_id = %user.id, "refresh token rotated concurrently");
        return Err(ApiError::unauthorized(STALE_REFRESH));
    }

    info!(user_id = %user.id, "tokens refreshed");
    Ok(tokens)
}

#[instrument(skip(st, req))]
pub async fn change_password(
    st: &AppState,
    user_id: Uuid,
    req: ChangePasswordRequest,
) -> Result<(), ApiError> {
    if req.new_password != req.confirm_password {
        return Err(ApiError::validation(
            "New password and confirm password do not match",
        ));
    }
    if req.new_password.trim().is_empty() {
        return Err(ApiError::validation("New password is required"));
    }

    let user = st
        .users
        .find_by_id(user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("User does not exist".into()))?;

    if !verify_password(&req.old_password, &user.password_hash)? {
        warn!(%user_id, "change password with wrong old password");
        return Err(ApiError::unauthorized("Invalid old password"));
    }

    let hash = hash_password(&req.new_password)?;
    st.users.set_password_hash(user_id, &hash).await?;
    info!(%user_id, "password changed");
    Ok(())
}
