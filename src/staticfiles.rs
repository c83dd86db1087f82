//! Static file locations
//!
//! The request path (after prefix removal) is resolved against the location's
//! root directory. If that is not a regular file, each `try_files` entry is
//! tried in order, with `$uri` replaced by the request path. Anything that
//! resolves outside the root is treated as missing.

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::plain_response;

#[derive(Debug, Clone)]
pub struct StaticSite {
    root: PathBuf,
    try_files: Vec<String>,
}

impl StaticSite {
    pub fn new(root: impl Into<PathBuf>, try_files: Vec<String>) -> Self {
        Self {
            root: root.into(),
            try_files,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serve `path` from the root, falling back through `try_files`
    pub async fn serve(&self, path: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        let Some(file) = self.resolve(path).await else {
            debug!(root = %self.root.display(), path, "Static file not found");
            return plain_response(StatusCode::NOT_FOUND);
        };

        match tokio::fs::read(&file).await {
            Ok(contents) => {
                let mime_type = mime_guess::from_path(&file).first_or_octet_stream();
                Response::builder()
                    .status(StatusCode::OK)
                    .header(hyper::header::CONTENT_TYPE, mime_type.as_ref())
                    .header(hyper::header::CONTENT_LENGTH, contents.len())
                    .body(
                        Full::new(Bytes::from(contents))
                            .map_err(|never| match never {})
                            .boxed(),
                    )
                    .unwrap_or_else(|_| plain_response(StatusCode::NOT_FOUND))
            }
            Err(e) => {
                warn!(file = %file.display(), error = %e, "Failed to read static file");
                plain_response(StatusCode::NOT_FOUND)
            }
        }
    }

    /// First existing regular file for `path`, if any
    pub async fn resolve(&self, path: &str) -> Option<PathBuf> {
        let root = tokio::fs::canonicalize(&self.root).await.ok()?;

        if let Some(found) = existing_file(&root, path).await {
            return Some(found);
        }
        for candidate in &self.try_files {
            let expanded = candidate.replace("$uri", path);
            if let Some(found) = existing_file(&root, &expanded).await {
                return Some(found);
            }
        }
        None
    }
}

async fn existing_file(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() || relative.split('/').any(|segment| segment == "..") {
        return None;
    }

    let canonical = tokio::fs::canonicalize(root.join(relative)).await.ok()?;
    // symlinks pointing outside the root
    if !canonical.starts_with(root) {
        return None;
    }
    let metadata = tokio::fs::metadata(&canonical).await.ok()?;
    metadata.is_file().then_some(canonical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn site_with(files: &[(&str, &str)], try_files: &[&str]) -> (tempfile::TempDir, StaticSite) {
        let dir = tempfile::tempdir().unwrap();
        for (name, contents) in files {
            let path = dir.path().join(name);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).unwrap();
            }
            fs::write(path, contents).unwrap();
        }
        let site = StaticSite::new(
            dir.path(),
            try_files.iter().map(|s| s.to_string()).collect(),
        );
        (dir, site)
    }

    async fn body_of(response: Response<BoxBody<Bytes, hyper::Error>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_serves_exact_file_with_mime() {
        let (_dir, site) = site_with(&[("css/site.css", "body{}")], &[]);
        let response = site.serve("/css/site.css").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/css"
        );
        assert_eq!(body_of(response).await, "body{}");
    }

    #[tokio::test]
    async fn test_try_files_fallback() {
        let (_dir, site) = site_with(&[("index.html", "<h1>app</h1>")], &["$uri.html", "index.html"]);
        let response = site.serve("/dashboard/settings").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/html"
        );
        assert_eq!(body_of(response).await, "<h1>app</h1>");
    }

    #[tokio::test]
    async fn test_uri_expansion() {
        let (_dir, site) = site_with(&[("about.html", "about"), ("index.html", "index")], &["$uri.html", "index.html"]);
        let response = site.serve("/about").await;
        assert_eq!(body_of(response).await, "about");
    }

    #[tokio::test]
    async fn test_not_found_without_fallback() {
        let (_dir, site) = site_with(&[("a.txt", "a")], &[]);
        assert_eq!(site.serve("/missing.txt").await.status(), StatusCode::NOT_FOUND);
        // directories are not files
        assert_eq!(site.serve("/").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let outer = tempfile::tempdir().unwrap();
        fs::write(outer.path().join("secret.txt"), "secret").unwrap();
        let root = outer.path().join("www");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("index.html"), "index").unwrap();

        let site = StaticSite::new(&root, vec![]);
        assert_eq!(site.serve("/../secret.txt").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(site.serve("/a/../../secret.txt").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(site.serve("/index.html").await.status(), StatusCode::OK);
    }
}
