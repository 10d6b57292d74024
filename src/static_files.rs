//! Static file fallback
//!
//! Serves files below the static root for requests that no worker claimed.
//! Anything with a dot-prefixed path segment is treated as absent, in both
//! lookups and directory listings.

use crate::error::{full_body, json_error_response, GatewayBody, GatewayErrorCode};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::{Response, StatusCode};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Serve a normalized URL path
    pub async fn serve(&self, url_path: &str, query: Option<&str>) -> Response<GatewayBody> {
        let segments: Vec<&str> = url_path.split('/').filter(|s| !s.is_empty()).collect();
        if segments.iter().any(|s| s.starts_with('.')) {
            debug!(path = %url_path, "Refusing hidden static path");
            return not_found(url_path);
        }

        let target = segments.iter().fold(self.root.clone(), |path, s| path.join(s));
        match self.serve_path(url_path, &segments, query, &target).await {
            Ok(response) => response,
            Err(e) if e.kind() == io::ErrorKind::NotFound => not_found(url_path),
            Err(e) => {
                warn!(path = %target.display(), error = %e, "Failed to serve static file");
                json_error_response(GatewayErrorCode::InternalError, "Failed to read static file")
            }
        }
    }

    async fn serve_path(
        &self,
        url_path: &str,
        segments: &[&str],
        query: Option<&str>,
        target: &Path,
    ) -> io::Result<Response<GatewayBody>> {
        // Symlinks may point anywhere; only serve what resolves inside the root
        let resolved = tokio::fs::canonicalize(target).await?;
        if !resolved.starts_with(&self.root) {
            return Err(io::ErrorKind::NotFound.into());
        }

        let metadata = tokio::fs::metadata(&resolved).await?;
        if !metadata.is_dir() {
            return serve_file(&resolved).await;
        }

        if !url_path.ends_with('/') {
            let encoded: Vec<_> = segments.iter().map(|s| urlencoding::encode(s)).collect();
            let location = match query {
                Some(q) => format!("/{}/?{}", encoded.join("/"), q),
                None => format!("/{}/", encoded.join("/")),
            };
            return Ok(Response::builder()
                .status(StatusCode::MOVED_PERMANENTLY)
                .header(LOCATION, location)
                .body(full_body(""))
                .expect("valid redirect response"));
        }

        let index = resolved.join("index.html");
        match tokio::fs::metadata(&index).await {
            Ok(meta) if meta.is_file() => serve_file(&index).await,
            _ => list_directory(url_path, &resolved).await,
        }
    }
}

async fn serve_file(path: &Path) -> io::Result<Response<GatewayBody>> {
    let contents = tokio::fs::read(path).await?;
    let mime = mime_guess::from_path(path).first_or_octet_stream();

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, mime.as_ref())
        .header(CONTENT_LENGTH, contents.len())
        .body(full_body(contents))
        .expect("valid file response"))
}

async fn list_directory(url_path: &str, dir: &Path) -> io::Result<Response<GatewayBody>> {
    let mut entries = Vec::new();
    let mut reader = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = reader.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        entries.push((name, is_dir));
    }
    entries.sort();

    let title = escape_html(url_path);
    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Index of {0}</title></head>\n<body>\n<h1>Index of {0}</h1>\n<ul>\n",
        title
    );
    for (name, is_dir) in entries {
        let slash = if is_dir { "/" } else { "" };
        html.push_str(&format!(
            "<li><a href=\"{}{}\">{}{}</a></li>\n",
            urlencoding::encode(&name),
            slash,
            escape_html(&name),
            slash
        ));
    }
    html.push_str("</ul>\n</body>\n</html>\n");

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(html))
        .expect("valid listing response"))
}

fn not_found(url_path: &str) -> Response<GatewayBody> {
    json_error_response(GatewayErrorCode::NotFound, format!("No worker or file at {}", url_path))
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
