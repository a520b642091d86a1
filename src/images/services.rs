use std::path::{Path, PathBuf};

use anyhow::Context;
use axum::extract::multipart::Field;
use bytes::Bytes;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::ApiError, state::AppState, users::repo_types::ProfileImage};

/// An uploaded file parked on local disk until it is pushed to the media store.
/// The file is deleted when this value is dropped.
pub struct StagedFile {
    file: NamedTempFile,
    content_type: String,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    fn discard(self) {
        let path: PathBuf = self.file.path().to_path_buf();
        if let Err(e) = self.file.close() {
            warn!(error = %e, path = %path.display(), "failed to remove staged upload");
        }
    }
}

pub async fn stage_bytes(
    upload_dir: &Path,
    body: Bytes,
    content_type: &str,
) -> anyhow::Result<StagedFile> {
    let file = tempfile::Builder::new()
        .prefix("upload-")
        .tempfile_in(upload_dir)
        .with_context(|| format!("create temp file in {}", upload_dir.display()))?;
    tokio::fs::write(file.path(), &body)
        .await
        .context("write staged upload")?;
    debug!(path = %file.path().display(), bytes = body.len(), "upload staged");
    Ok(StagedFile {
        file,
        content_type: content_type.to_string(),
    })
}

/// Stages a multipart file field. An empty field counts as no file.
pub async fn stage_field(
    st: &AppState,
    field: Field<'_>,
) -> Result<Option<StagedFile>, ApiError> {
    let content_type = field
        .content_type()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "application/octet-stream".into());
    let data = field.bytes().await?;
    if data.is_empty() {
        return Ok(None);
    }
    Ok(Some(
        stage_bytes(&st.config.upload_dir, data, &content_type).await?,
    ))
}

/// Pushes a staged file to the media store and returns its public URL.
///
/// Failures are logged and reported as `None`. The local file is removed
/// in every case.
pub async fn upload_on_media_store(
    st: &AppState,
    staged: Option<StagedFile>,
    slot: ProfileImage,
) -> Option<String> {
    let staged = staged?;
    let result = push(st, &staged, slot).await;
    staged.discard();
    match result {
        Ok(url) => Some(url),
        Err(e) => {
            warn!(error = ?e, slot = slot.field_name(), "media upload failed");
            None
        }
    }
}

/// Deletes an object previously returned by `upload_on_media_store`.
/// Failures are logged and swallowed.
pub async fn remove_from_media_store(st: &AppState, url: &str) {
    let Some(key) = st.storage.object_key(url) else {
        warn!(%url, "not a media store url; nothing removed");
        return;
    };
    match st.storage.delete_object(&key).await {
        Ok(()) => debug!(%key, "media object removed"),
        Err(e) => warn!(error = ?e, %key, "failed to remove media object"),
    }
}

async fn push(st: &AppState, staged: &StagedFile, slot: ProfileImage) -> anyhow::Result<String> {
    let body = tokio::fs::read(staged.path())
        .await
        .context("read staged upload")?;
    let ext = ext_from_mime(&staged.content_type).unwrap_or("bin");
    let key = format!("{}/{}.{}", slot.folder(), Uuid::new_v4(), ext);
    st.storage
        .put_object(&key, Bytes::from(body), &staged.content_type)
        .await
        .with_context(|| format!("put_object {}", key))?;
    Ok(st.storage.object_url(&key))
}

fn ext_from_mime(ct: &str) -> Option<&'static str> {
    match ct {
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/png" => Some("png"),
        "image/webp" => Some("webp"),
        "image/gif" => Some("gif"),
        "image/heic" => Some("heic"),
        _ => None,
    }
}
