//! Object storage uploads for non-text message payloads

use std::path::Path;

use super::client::BaasClient;
use super::gateway::GatewayError;

/// Content type from a file extension, defaulting to an opaque byte stream.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Object name under the bucket: `<user>/<uuid>[.<ext>]`.
pub fn object_path(user_id: &str, local_path: &Path) -> String {
    let id = uuid::Uuid::new_v4();
    match local_path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}/{}.{}", user_id, id, ext.to_ascii_lowercase()),
        None => format!("{}/{}", user_id, id),
    }
}

/// Read a local file, upload it and return its public URL.
pub async fn upload_file(
    client: &BaasClient,
    bucket: &str,
    local_path: &Path,
) -> Result<String, GatewayError> {
    let bytes = tokio::fs::read(local_path).await?;
    let object = object_path(client.user_id(), local_path);
    let content_type = content_type_for(local_path);

    tracing::info!(
        "Uploading {} ({} bytes, {}) to {}/{}",
        local_path.display(),
        bytes.len(),
        content_type,
        bucket,
        object
    );
    client
        .storage_upload(bucket, &object, bytes, content_type)
        .await?;

    Ok(client.public_object_url(bucket, &object))
}
