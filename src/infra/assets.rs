//! Loopback asset server for locally cached fonts.

use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use mime_guess::{Mime, MimeGuess};
use tracing::{debug, warn};

const SOURCE: &str = "infra::assets";

#[derive(Debug)]
struct AssetRoot {
    directory: PathBuf,
}

/// Router serving `directory` under `mount_path` (e.g. `/waves/fonts`).
///
/// Every file response carries permissive CORS headers so pages loaded from
/// `about:blank` can fetch fonts; rejected and missing paths are plain 404s.
pub fn router(directory: impl Into<PathBuf>, mount_path: &str) -> Router {
    let mount_path = mount_path.trim_matches('/');
    let route = format!("/{mount_path}/{{*path}}");
    let root = Arc::new(AssetRoot {
        directory: directory.into(),
    });

    Router::new()
        .route(&route, get(serve_asset))
        .with_state(root)
}

async fn serve_asset(State(root): State<Arc<AssetRoot>>, Path(path): Path<String>) -> Response {
    match resolve_asset(&root, path).await {
        Ok(Some(asset)) => asset.into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(status) => status.into_response(),
    }
}

struct Asset {
    contents: Bytes,
    mime: MimeGuess,
}

async fn resolve_asset(root: &AssetRoot, path: String) -> Result<Option<Asset>, StatusCode> {
    let candidate = path.trim_start_matches('/');
    if candidate.is_empty()
        || candidate.ends_with('/')
        || candidate.contains("..")
        || candidate.contains('\\')
    {
        // Avoid directory traversal and disallow directory listings.
        return Ok(None);
    }

    let full_path = root.directory.join(candidate);
    match tokio::fs::metadata(&full_path).await {
        Ok(metadata) if metadata.is_file() => {}
        Ok(_) => return Ok(None),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            debug!(
                target = SOURCE,
                op = "assets::resolve",
                result = "missing",
                path = candidate,
                "Asset not found"
            );
            return Ok(None);
        }
        Err(err) => {
            warn!(
                target = SOURCE,
                op = "assets::resolve",
                result = "error",
                path = candidate,
                error = %err,
                "Failed to stat asset"
            );
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    let contents = tokio::fs::read(&full_path).await.map_err(|err| {
        warn!(
            target = SOURCE,
            op = "assets::read",
            result = "error",
            path = candidate,
            error = %err,
            "Failed to read asset"
        );
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Some(Asset {
        contents: Bytes::from(contents),
        mime: mime_guess::from_path(candidate),
    }))
}

impl IntoResponse for Asset {
    fn into_response(self) -> Response {
        build_response(self.contents, self.mime.first_or_octet_stream())
    }
}

fn build_response(bytes: Bytes, mime: Mime) -> Response {
    let len = bytes.len();
    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::from_str(&len.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, HEAD"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=3600"),
    );

    response
}
