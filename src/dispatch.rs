//! Request path resolution
//!
//! A decoded request path is normalized lexically against the worker root
//! first; a path that climbs above the root is rejected before the filesystem
//! is touched. The longest prefix naming an executable worker wins and the
//! rest of the path becomes `PATH_INFO`.

use crate::config::WorkerConfig;
use std::path::PathBuf;
use tracing::trace;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("request path {0:?} is not valid UTF-8")]
    BadEncoding(String),

    #[error("request path {0:?} escapes the worker root")]
    Forbidden(String),
}

/// A request bound for a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRoute {
    /// Absolute path of the worker executable
    pub identity: PathBuf,
    pub script_name: String,
    pub path_info: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Worker(WorkerRoute),
    /// No worker matched. Carries the normalized path for the static handler.
    Static(String),
}

/// Normalized request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanPath {
    pub segments: Vec<String>,
    pub trailing_slash: bool,
}

impl CleanPath {
    /// Percent-decode and resolve `.` and `..` segments. Never touches the
    /// filesystem.
    pub fn parse(raw: &str) -> Result<Self, DispatchError> {
        let decoded = urlencoding::decode(raw).map_err(|_| DispatchError::BadEncoding(raw.to_string()))?;
        if decoded.contains('\0') {
            return Err(DispatchError::BadEncoding(raw.to_string()));
        }

        let mut segments: Vec<String> = Vec::new();
        for segment in decoded.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    if segments.pop().is_none() {
                        return Err(DispatchError::Forbidden(raw.to_string()));
                    }
                }
                other => segments.push(other.to_string()),
            }
        }

        Ok(Self {
            trailing_slash: decoded.ends_with('/') && !segments.is_empty(),
            segments,
        })
    }

    fn join(segments: &[String]) -> String {
        format!("/{}", segments.join("/"))
    }

    /// The path as a URL path, keeping a trailing slash
    pub fn to_url_path(&self) -> String {
        let mut path = Self::join(&self.segments);
        if self.trailing_slash {
            path.push('/');
        }
        path
    }
}

pub struct Dispatcher {
    root: PathBuf,
    suffix: String,
}

impl Dispatcher {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            root: config.root.clone(),
            suffix: config.suffix.clone(),
        }
    }

    fn has_suffix(&self, segment: &str) -> bool {
        segment.len() > self.suffix.len() && segment.ends_with(&self.suffix)
    }

    /// Decide where a request path goes
    pub async fn resolve(&self, raw_path: &str) -> Result<Route, DispatchError> {
        let clean = CleanPath::parse(raw_path)?;

        for end in (1..=clean.segments.len()).rev() {
            if !self.has_suffix(&clean.segments[end - 1]) {
                continue;
            }

            let candidate = clean.segments[..end]
                .iter()
                .fold(self.root.clone(), |path, segment| path.join(segment));
            if !is_executable_file(&candidate).await {
                trace!(candidate = %candidate.display(), "Not an executable worker");
                continue;
            }

            let rest = &clean.segments[end..];
            let path_info = if rest.is_empty() {
                String::new()
            } else if clean.trailing_slash {
                format!("{}/", CleanPath::join(rest))
            } else {
                CleanPath::join(rest)
            };

            return Ok(Route::Worker(WorkerRoute {
                identity: candidate,
                script_name: CleanPath::join(&clean.segments[..end]),
                path_info,
            }));
        }

        Ok(Route::Static(clean.to_url_path()))
    }
}

#[cfg(unix)]
async fn is_executable_file(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
async fn is_executable_file(path: &std::path::Path) -> bool {
    tokio::fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::write_executable;

    fn dispatcher(root: &std::path::Path) -> Dispatcher {
        let mut config = WorkerConfig::default();
        config.root = std::fs::canonicalize(root).unwrap();
        Dispatcher::new(&config)
    }

    #[test]
    fn test_clean_path() {
        let clean = CleanPath::parse("/a/./b//c/../d/").unwrap();
        assert_eq!(clean.segments, vec!["a", "b", "d"]);
        assert!(clean.trailing_slash);
        assert_eq!(clean.to_url_path(), "/a/b/d/");

        let root = CleanPath::parse("/").unwrap();
        assert!(root.segments.is_empty());
        assert_eq!(root.to_url_path(), "/");
    }

    #[test]
    fn test_traversal_is_forbidden() {
        assert!(matches!(
            CleanPath::parse("/../../etc/passwd"),
            Err(DispatchError::Forbidden(_))
        ));
        assert!(matches!(
            CleanPath::parse("/%2e%2e/%2e%2e/etc/passwd"),
            Err(DispatchError::Forbidden(_))
        ));
        assert!(matches!(
            CleanPath::parse("/a/..%2f..%2fetc"),
            Err(DispatchError::Forbidden(_))
        ));
        assert!(CleanPath::parse("/a/../b").is_ok());
    }

    #[test]
    fn test_bad_encoding() {
        assert!(matches!(CleanPath::parse("/%ff.fcgi"), Err(DispatchError::BadEncoding(_))));
        assert!(matches!(CleanPath::parse("/a%00.fcgi"), Err(DispatchError::BadEncoding(_))));
    }

    #[tokio::test]
    async fn test_resolves_worker() {
        let dir = tempfile::tempdir().unwrap();
        let app = write_executable(dir.path(), "app.fcgi");
        let dispatcher = dispatcher(dir.path());

        let route = dispatcher.resolve("/app.fcgi").await.unwrap();
        assert_eq!(
            route,
            Route::Worker(WorkerRoute {
                identity: app,
                script_name: "/app.fcgi".to_string(),
                path_info: String::new(),
            })
        );
    }

    #[tokio::test]
    async fn test_sub_path_becomes_path_info() {
        let dir = tempfile::tempdir().unwrap();
        let app = write_executable(dir.path(), "app.fcgi");
        let dispatcher = dispatcher(dir.path());

        match dispatcher.resolve("/app.fcgi/users/123").await.unwrap() {
            Route::Worker(route) => {
                assert_eq!(route.identity, app);
                assert_eq!(route.script_name, "/app.fcgi");
                assert_eq!(route.path_info, "/users/123");
            }
            other => panic!("expected worker route, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nested_worker_and_decoding() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("api")).unwrap();
        let api = write_executable(&dir.path().join("api"), "my app.fcgi");
        let dispatcher = dispatcher(dir.path());

        match dispatcher.resolve("/api/my%20app.fcgi/x/").await.unwrap() {
            Route::Worker(route) => {
                assert_eq!(route.identity, api);
                assert_eq!(route.script_name, "/api/my app.fcgi");
                assert_eq!(route.path_info, "/x/");
            }
            other => panic!("expected worker route, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_workers_fall_through_to_static() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plain.fcgi"), "not executable").unwrap();
        write_executable(dir.path(), "tool.sh");
        std::fs::create_dir(dir.path().join("dir.fcgi")).unwrap();
        let dispatcher = dispatcher(dir.path());

        assert_eq!(
            dispatcher.resolve("/plain.fcgi").await.unwrap(),
            Route::Static("/plain.fcgi".to_string())
        );
        assert_eq!(
            dispatcher.resolve("/tool.sh").await.unwrap(),
            Route::Static("/tool.sh".to_string())
        );
        assert_eq!(
            dispatcher.resolve("/dir.fcgi/").await.unwrap(),
            Route::Static("/dir.fcgi/".to_string())
        );
        assert_eq!(
            dispatcher.resolve("/missing.fcgi").await.unwrap(),
            Route::Static("/missing.fcgi".to_string())
        );
    }

    #[tokio::test]
    async fn test_longest_executable_prefix_wins() {
        let dir = tempfile::tempdir().unwrap();
        let outer = write_executable(dir.path(), "outer.fcgi");
        let dispatcher = dispatcher(dir.path());

        // "inner.fcgi" below a file cannot exist, so the outer worker is used
        match dispatcher.resolve("/outer.fcgi/inner.fcgi").await.unwrap() {
            Route::Worker(route) => {
                assert_eq!(route.identity, outer);
                assert_eq!(route.path_info, "/inner.fcgi");
            }
            other => panic!("expected worker route, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_traversal_rejected_by_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let dispatcher = dispatcher(dir.path());
        assert!(matches!(
            dispatcher.resolve("/../../etc/passwd").await,
            Err(DispatchError::Forbidden(_))
        ));
    }
}
