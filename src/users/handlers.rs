use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, State},
    routing::{get, patch},
    Json, Router,
};
use tracing::instrument;

use super::{
    dto::UpdateAccountRequest,
    repo_types::{ProfileImage, PublicUser},
    services,
};
use crate::{
    auth::extractors::AuthUser,
    error::ApiError,
    images::services::{stage_field, StagedFile},
    response::ApiResponse,
    state::AppState,
};

pub fn user_routes() -> Router<AppState> {
    Router::new()
        .route("/current-user", get(current_user))
        .route("/update-account-details", patch(update_account_details))
        .merge(
            Router::new()
                .route("/update-user-avatar", patch(update_avatar))
                .route("/update-user-cover-image", patch(update_cover_image))
                .layer(DefaultBodyLimit::max(20 * 1024 * 1024)), // 20MB
        )
}

pub async fn current_user(AuthUser(user): AuthUser) -> ApiResponse<PublicUser> {
    ApiResponse::ok(user, "Current user fetched successfully")
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn update_account_details(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    payload: Result<Json<UpdateAccountRequest>, JsonRejection>,
) -> Result<ApiResponse<PublicUser>, ApiError> {
    let Json(body) = payload?;
    let updated =
        services::update_account_details(&state, user.id, &body.full_name, &body.email).await?;
    Ok(ApiResponse::ok(updated, "Account details updated successfully"))
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn update_avatar(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    mp: Multipart,
) -> Result<ApiResponse<PublicUser>, ApiError> {
    replace_image(&state, user, ProfileImage::Avatar, mp).await
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn update_cover_image(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    mp: Multipart,
) -> Result<ApiResponse<PublicUser>, ApiError> {
    replace_image(&state, user, ProfileImage::CoverImage, mp).await
}

async fn replace_image(
    state: &AppState,
    user: PublicUser,
    slot: ProfileImage,
    mut mp: Multipart,
) -> Result<ApiResponse<PublicUser>, ApiError> {
    let mut staged: Option<StagedFile> = None;
    while let Some(field) = mp.next_field().await? {
        if field.name() == Some(slot.field_name()) && staged.is_none() {
            staged = stage_field(state, field).await?;
        }
    }
    let updated = services::update_image(state, user.id, slot, staged).await?;
    let message = match slot {
        ProfileImage::Avatar => "Avatar updated successfully",
        ProfileImage::CoverImage => "Cover image updated successfully",
    };
    Ok(ApiResponse::ok(updated, message))
}
