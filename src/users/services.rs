use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::repo::is_unique_violation;
use super::repo_types::{ProfileImage, PublicUser};
use crate::{
    error::ApiError,
    images::services::{upload_on_media_store, StagedFile},
    state::AppState,
};

fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Trims and lowercases; rejects anything that does not look like an address.
pub(crate) fn normalize_email(raw: &str) -> Result<String, ApiError> {
    let email = raw.trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(ApiError::validation("Invalid email"));
    }
    Ok(email)
}

#[instrument(skip(st))]
pub async fn update_account_details(
    st: &AppState,
    user_id: Uuid,
    full_name: &str,
    email: &str,
) -> Result<PublicUser, ApiError> {
    let full_name = full_name.trim();
    if full_name.is_empty() || email.trim().is_empty() {
        return Err(ApiError::validation("Full name and email are required"));
    }
    let email = normalize_email(email)?;

    if let Some(other) = st.users.find_by_username_or_email(None, Some(&email)).await? {
        if other.id != user_id {
            warn!(%user_id, "email already in use");
            return Err(ApiError::Conflict("Email already in use".into()));
        }
    }

    let user = st
        .users
        .update_account_details(user_id, full_name, &email)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ApiError::Conflict("Email already in use".into())
            } else {
                e.into()
            }
        })?
        .ok_or_else(|| ApiError::NotFound("User does not exist".into()))?;

    info!(%user_id, "account details updated");
    Ok(user.into())
}

/// Replaces the avatar or cover image. The record is left untouched unless
/// the upload succeeds.
#[instrument(skip(st, staged))]
pub async fn update_image(
    st: &AppState,
    user_id: Uuid,
    slot: ProfileImage,
    staged: Option<StagedFile>,
) -> Result<PublicUser, ApiError> {
    if staged.is_none() {
        return Err(ApiError::validation(format!(
            "{} file is missing",
            slot.field_name()
        )));
    }
    let url = upload_on_media_store(st, staged, slot)
        .await
        .ok_or_else(|| {
            ApiError::validation(format!("Error while uploading {}", slot.field_name()))
        })?;

    let user = st
        .users
        .update_image(user_id, slot, &url)
        .await?
        .ok_or_else(|| ApiError::NotFound("User does not exist".into()))?;

    info!(%user_id, slot = slot.field_name(), "profile image updated");
    Ok(user.into())
}
