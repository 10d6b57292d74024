//! Error types and JSON error responses for the gateway

use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Boxed error carried by response bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type of every response the gateway produces
pub type GatewayBody = UnsyncBoxBody<Bytes, BoxError>;

/// Errors raised while bringing a worker up
#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("worker binary {0} not found")]
    BinaryMissing(PathBuf),

    #[error("cannot inspect worker binary {path}: {source}")]
    Inspect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot prepare transport for {path}: {source}")]
    Transport {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start {path}: {source}")]
    Start {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker {path} exited during startup ({status})")]
    ExitedEarly { path: PathBuf, status: String },

    #[error("worker {path} not accepting connections after {attempts} attempts: {source}")]
    NotReady {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while exchanging a request with a ready worker
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("cannot connect to worker: {0}")]
    Connect(#[source] std::io::Error),

    #[error("i/o error talking to worker: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to read request body: {0}")]
    RequestBody(#[source] BoxError),

    #[error("malformed response from worker: {0}")]
    Malformed(String),

    #[error("worker closed the connection before sending a response")]
    Truncated,
}

/// Error codes for responses generated by the gateway itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayErrorCode {
    /// Request path resolves outside the worker root
    Forbidden,
    /// No worker and no static file for this path
    NotFound,
    /// Worker could not be started
    WorkerStartFailed,
    /// Worker was unreachable or spoke a broken protocol
    WorkerUnreachable,
    /// Request path could not be decoded
    BadRequest,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::Forbidden => StatusCode::FORBIDDEN,
            GatewayErrorCode::NotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::WorkerStartFailed => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayErrorCode::WorkerUnreachable => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::Forbidden => "FORBIDDEN",
            GatewayErrorCode::NotFound => "NOT_FOUND",
            GatewayErrorCode::WorkerStartFailed => "WORKER_START_FAILED",
            GatewayErrorCode::WorkerUnreachable => "WORKER_UNREACHABLE",
            GatewayErrorCode::BadRequest => "BAD_REQUEST",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GatewayErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Wrap a complete in-memory payload as a gateway body
pub fn full_body(bytes: impl Into<Bytes>) -> GatewayBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed_unsync()
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(code: GatewayErrorCode, message: impl Into<String>) -> Response<GatewayBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}
