//! HTTP front end
//!
//! [`Gateway`] turns one HTTP request into a dispatch decision, a worker lease
//! and a bridged exchange. [`GatewayServer`] owns the TCP listener and serves
//! connections until the shutdown signal flips. The idle reaper and the
//! binary watcher run as [`BackgroundTasks`].

use crate::bridge::{self, CgiTarget, ConnInfo};
use crate::config::Config;
use crate::dispatch::{DispatchError, Dispatcher, Route, WorkerRoute};
use crate::error::{json_error_response, BoxError, GatewayBody, GatewayErrorCode};
use crate::launcher::{Launch, ProcessLauncher};
use crate::registry::{Registry, RetireReason};
use crate::static_files::StaticFiles;
use crate::watcher::BinaryWatcher;
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";

pub struct Gateway {
    config: Arc<Config>,
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    static_files: Option<StaticFiles>,
}

impl Gateway {
    /// Gateway that launches real worker processes
    pub fn new(config: Config) -> Arc<Self> {
        let launcher = Arc::new(ProcessLauncher::new(config.workers.clone()));
        Self::with_launcher(config, launcher)
    }

    pub fn with_launcher(config: Config, launcher: Arc<dyn Launch>) -> Arc<Self> {
        let registry = Arc::new(Registry::new(launcher, config.workers.shutdown_grace_period()));
        let dispatcher = Dispatcher::new(&config.workers);
        let static_files = config.server.static_root.clone().map(StaticFiles::new);
        Arc::new(Self {
            config: Arc::new(config),
            registry,
            dispatcher,
            static_files,
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Handle one request. Never fails: every error becomes a response.
    pub async fn handle<B>(&self, mut req: Request<B>, conn: ConnInfo) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Into<BoxError>,
    {
        let start = Instant::now();

        // Generate or propagate request ID
        let request_id = req
            .headers()
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let request_id_value = HeaderValue::from_str(&request_id).ok();
        if let Some(ref value) = request_id_value {
            req.headers_mut().insert(X_REQUEST_ID, value.clone());
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let mut response = match self.dispatcher.resolve(&path).await {
            Ok(Route::Worker(route)) => self.dispatch_worker(route, req, conn).await,
            Ok(Route::Static(clean_path)) => match self.static_files {
                Some(ref files) => files.serve(&clean_path, req.uri().query()).await,
                None => json_error_response(
                    GatewayErrorCode::NotFound,
                    format!("No worker at {}", clean_path),
                ),
            },
            Err(DispatchError::Forbidden(raw)) => {
                warn!(path = %raw, client = %conn.remote_addr, "Rejected path outside worker root");
                json_error_response(GatewayErrorCode::Forbidden, "Path escapes the worker root")
            }
            Err(e @ DispatchError::BadEncoding(_)) => {
                debug!(error = %e, "Rejected undecodable path");
                json_error_response(GatewayErrorCode::BadRequest, "Invalid request path")
            }
        };

        if let Some(value) = request_id_value {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }

        debug!(
            request_id = %request_id,
            %method,
            path = %path,
            status = response.status().as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Request handled"
        );
        response
    }

    async fn dispatch_worker<B>(&self, route: WorkerRoute, req: Request<B>, conn: ConnInfo) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes> + Unpin,
        B::Error: Into<BoxError>,
    {
        let lease = match self.registry.get_or_create(&route.identity).await {
            Ok(lease) => lease,
            Err(e) => {
                error!(identity = %route.identity.display(), error = %e, "Failed to start worker");
                return json_error_response(GatewayErrorCode::WorkerStartFailed, "Failed to start worker");
            }
        };

        let target = CgiTarget {
            script_name: &route.script_name,
            path_info: &route.path_info,
            document_root: &self.config.workers.root,
        };

        match bridge::forward(&lease, target, conn, req).await {
            Ok(response) => {
                self.registry.touch(&lease);
                response
            }
            Err(e) => {
                warn!(
                    identity = %lease.identity.display(),
                    pid = lease.pid,
                    endpoint = %lease.endpoint,
                    error = %e,
                    "Worker exchange failed"
                );
                json_error_response(GatewayErrorCode::WorkerUnreachable, "Worker unreachable")
            }
        }
    }

    /// Start the idle reaper and the binary watcher
    pub fn start_background(self: &Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> BackgroundTasks {
        let reaper = tokio::spawn(reap_loop(
            Arc::clone(&self.registry),
            self.config.workers.reap_interval(),
            shutdown_rx,
        ));

        let watcher = match BinaryWatcher::start(&self.config.workers, Arc::clone(&self.registry)) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(root = %self.config.workers.root.display(), error = %e, "Binary watcher unavailable, relying on per-request staleness checks");
                None
            }
        };

        BackgroundTasks { reaper, watcher }
    }

    /// Retire every worker. Returns how many were running.
    pub async fn shutdown(&self) -> usize {
        self.registry.retire_all(RetireReason::Shutdown).await
    }
}

/// Handles of the long-lived tasks started by [`Gateway::start_background`]
pub struct BackgroundTasks {
    reaper: JoinHandle<()>,
    watcher: Option<BinaryWatcher>,
}

impl BackgroundTasks {
    /// Wait for the reaper to observe shutdown and stop the watcher
    pub async fn stop(self) {
        if let Some(watcher) = self.watcher {
            watcher.stop().await;
        }
        if let Err(e) = self.reaper.await {
            warn!(error = %e, "Reaper task ended abnormally");
        }
    }
}

/// Run reaper cycles every `interval` until shutdown
pub async fn reap_loop(registry: Arc<Registry>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let report = registry.reap().await;
                if report.exited > 0 || report.idle > 0 {
                    info!(exited = report.exited, idle = report.idle, busy = report.busy, "Reaper cycle");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("Reaper stopping");
                    break;
                }
            }
        }
    }
}

/// The HTTP listener
pub struct GatewayServer {
    listener: TcpListener,
    gateway: Arc<Gateway>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub async fn bind(addr: &str, gateway: Arc<Gateway>, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
        Ok(Self {
            listener,
            gateway,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            let gateway = Arc::clone(&self.gateway);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, remote_addr, gateway).await {
                                    debug!(addr = %remote_addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, remote_addr: SocketAddr, gateway: Arc<Gateway>) -> anyhow::Result<()> {
    let conn = ConnInfo {
        remote_addr,
        local_addr: stream.local_addr()?,
    };
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gateway = Arc::clone(&gateway);
        async move { Ok::<_, Infallible>(gateway.handle(req, conn).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_executable, FakeLauncher};
    use http_body_util::{BodyExt, Full};
    use hyper::StatusCode;

    struct Fixture {
        _web: tempfile::TempDir,
        _statics: tempfile::TempDir,
        launcher: Arc<FakeLauncher>,
        gateway: Arc<Gateway>,
    }

    fn fixture(with_static: bool) -> Fixture {
        let web = tempfile::tempdir().unwrap();
        let statics = tempfile::tempdir().unwrap();
        write_executable(web.path(), "app.fcgi");
        std::fs::write(statics.path().join("robots.txt"), "User-agent: *").unwrap();
        std::fs::write(statics.path().join(".htpasswd"), "admin:x").unwrap();

        let mut config: Config = toml::from_str("").unwrap();
        config.workers.root = web.path().to_path_buf();
        if with_static {
            config.server.static_root = Some(statics.path().to_path_buf());
        }
        config.validate().unwrap();

        let launcher = FakeLauncher::new(&config.workers.root, config.workers.idle_timeout());
        let gateway = Gateway::with_launcher(config, Arc::clone(&launcher) as Arc<dyn Launch>);
        Fixture {
            _web: web,
            _statics: statics,
            launcher,
            gateway,
        }
    }

    fn conn() -> ConnInfo {
        ConnInfo {
            remote_addr: "127.0.0.1:40000".parse().unwrap(),
            local_addr: "127.0.0.1:8080".parse().unwrap(),
        }
    }

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::builder().uri(path).body(Full::new(Bytes::new())).unwrap()
    }

    #[tokio::test]
    async fn test_traversal_is_forbidden() {
        let f = fixture(true);
        let response = f.gateway.handle(get("/../../etc/passwd"), conn()).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers().get("X-Gateway-Error").unwrap(), "FORBIDDEN");
        assert_eq!(f.launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_unknown_path_without_static_root_is_404() {
        let f = fixture(false);
        let response = f.gateway.handle(get("/robots.txt"), conn()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_static_fallback_hides_dot_files() {
        let f = fixture(true);

        let response = f.gateway.handle(get("/robots.txt"), conn()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"User-agent: *");

        let response = f.gateway.handle(get("/.htpasswd"), conn()).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_request_id_is_propagated_or_generated() {
        let f = fixture(true);

        let req = Request::builder()
            .uri("/robots.txt")
            .header("X-Request-ID", "req-123")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let response = f.gateway.handle(req, conn()).await;
        assert_eq!(response.headers().get(X_REQUEST_ID).unwrap(), "req-123");

        let response = f.gateway.handle(get("/missing"), conn()).await;
        let generated = response.headers().get(X_REQUEST_ID).unwrap().to_str().unwrap();
        assert!(Uuid::parse_str(generated).is_ok());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_500() {
        let f = fixture(false);
        f.launcher.fail_next();

        let response = f.gateway.handle(get("/app.fcgi"), conn()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("X-Gateway-Error").unwrap(),
            "WORKER_START_FAILED"
        );
    }

    #[tokio::test]
    async fn test_binary_gone_at_spawn_time_is_500() {
        let f = fixture(false);
        let route = WorkerRoute {
            identity: f.gateway.config.workers.root.join("gone.fcgi"),
            script_name: "/gone.fcgi".to_string(),
            path_info: String::new(),
        };

        let response = f.gateway.dispatch_worker(route, get("/gone.fcgi"), conn()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get("X-Gateway-Error").unwrap(),
            "WORKER_START_FAILED"
        );
        assert_eq!(f.launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_worker_is_502_and_stays_registered() {
        // The fake launcher's socket is a plain file, so connecting fails
        let f = fixture(false);

        let response = f.gateway.handle(get("/app.fcgi/anything"), conn()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(f.launcher.launches(), 1);
        assert_eq!(f.gateway.registry().len().await, 1);

        assert_eq!(f.gateway.shutdown().await, 1);
        assert!(f.gateway.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_reap_loop_stops_on_shutdown() {
        let f = fixture(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(reap_loop(
            Arc::clone(f.gateway.registry()),
            Duration::from_millis(10),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reaper stops promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn test_background_tasks_stop() {
        let f = fixture(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = f.gateway.start_background(shutdown_rx);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), tasks.stop())
            .await
            .expect("background tasks stop promptly");
    }
}
