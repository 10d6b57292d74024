//! HTTP to FastCGI bridge
//!
//! Each request gets a fresh connection to the worker. The request body is
//! streamed as stdin records; the worker's stdout is parsed for CGI headers
//! and the rest is streamed back to the client as it arrives.

use crate::error::{BoxError, GatewayBody, ProtocolError};
use crate::fcgi::{
    parse_cgi_head, read_record, write_begin_request, write_params, write_stream, CgiHead,
    RecordType, REQUEST_ID,
};
use crate::registry::WorkerLease;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Body, Bytes, Frame};
use hyper::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use hyper::http::request::Parts;
use hyper::{HeaderMap, Request, Response};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, warn};

const SERVER_SOFTWARE: &str = concat!("fcgi-gateway/", env!("CARGO_PKG_VERSION"));

/// Where the request is going, as resolved by the dispatcher
#[derive(Debug, Clone, Copy)]
pub struct CgiTarget<'a> {
    /// URL path of the worker executable
    pub script_name: &'a str,
    /// Remainder of the URL path after the executable
    pub path_info: &'a str,
    pub document_root: &'a Path,
}

/// Addresses of the client connection
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
}

enum RequestBody<B> {
    Buffered(Bytes),
    Streaming(B),
}

/// Build the CGI environment for a request
pub fn cgi_env(
    parts: &Parts,
    lease: &WorkerLease,
    target: CgiTarget<'_>,
    conn: ConnInfo,
    content_length: u64,
) -> Vec<(String, String)> {
    let content_type = parts
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();

    let request_uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let mut env = vec![
        ("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string()),
        ("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string()),
        ("SERVER_PROTOCOL".to_string(), format!("{:?}", parts.version)),
        ("SERVER_ADDR".to_string(), conn.local_addr.ip().to_string()),
        ("SERVER_PORT".to_string(), conn.local_addr.port().to_string()),
        ("REQUEST_METHOD".to_string(), parts.method.to_string()),
        ("REQUEST_URI".to_string(), request_uri),
        ("QUERY_STRING".to_string(), parts.uri.query().unwrap_or("").to_string()),
        ("CONTENT_TYPE".to_string(), content_type),
        ("CONTENT_LENGTH".to_string(), content_length.to_string()),
        (
            "SCRIPT_FILENAME".to_string(),
            lease.identity.to_string_lossy().into_owned(),
        ),
        ("SCRIPT_NAME".to_string(), target.script_name.to_string()),
        ("PATH_INFO".to_string(), target.path_info.to_string()),
        (
            "DOCUMENT_URI".to_string(),
            format!("{}{}", target.script_name, target.path_info),
        ),
        (
            "DOCUMENT_ROOT".to_string(),
            target.document_root.to_string_lossy().into_owned(),
        ),
        ("REMOTE_ADDR".to_string(), conn.remote_addr.ip().to_string()),
        ("REMOTE_PORT".to_string(), conn.remote_addr.port().to_string()),
    ];

    for name in parts.headers.keys() {
        // httpoxy: never let a client set HTTP_PROXY
        if *name == HOST || name.as_str() == "proxy" {
            continue;
        }
        let values: Vec<&str> = parts
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if values.is_empty() {
            continue;
        }
        let key = format!("HTTP_{}", name.as_str().to_ascii_uppercase().replace('-', "_"));
        env.push((key, values.join(", ")));
    }
    env.push(("HTTP_HOST".to_string(), host));

    env
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Send a request to the worker behind `lease` and return its response. The
/// response body streams from the worker after this returns.
pub async fn forward<B>(
    lease: &WorkerLease,
    target: CgiTarget<'_>,
    conn: ConnInfo,
    request: Request<B>,
) -> Result<Response<GatewayBody>, ProtocolError>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    let (parts, body) = request.into_parts();

    let (content_length, body) = match declared_length(&parts.headers) {
        Some(len) => (len, RequestBody::Streaming(body)),
        None => {
            let bytes = body
                .collect()
                .await
                .map_err(|e| ProtocolError::RequestBody(e.into()))?
                .to_bytes();
            (bytes.len() as u64, RequestBody::Buffered(bytes))
        }
    };

    let env = cgi_env(&parts, lease, target, conn, content_length);

    let stream = lease.endpoint.connect().await.map_err(ProtocolError::Connect)?;
    let (read_half, write_half) = stream.into_split();
    let mut writer = BufWriter::new(write_half);

    write_begin_request(&mut writer, REQUEST_ID, false).await?;
    write_params(&mut writer, REQUEST_ID, &env).await?;

    match body {
        RequestBody::Buffered(bytes) => {
            if !bytes.is_empty() {
                write_stream(&mut writer, RecordType::Stdin, REQUEST_ID, &bytes).await?;
            }
        }
        RequestBody::Streaming(mut body) => {
            while let Some(frame) = body.frame().await {
                let frame = frame.map_err(|e| ProtocolError::RequestBody(e.into()))?;
                if let Ok(data) = frame.into_data() {
                    if !data.is_empty() {
                        write_stream(&mut writer, RecordType::Stdin, REQUEST_ID, &data).await?;
                    }
                }
            }
        }
    }
    write_stream(&mut writer, RecordType::Stdin, REQUEST_ID, &[]).await?;
    writer.flush().await?;

    let mut output = WorkerOutput {
        reader: BufReader::new(read_half),
        _writer: writer.into_inner(),
        identity: lease.identity.clone(),
        finished: false,
    };
    let (head, leftover) = output.read_head().await?;

    let mut builder = Response::builder().status(head.status);
    for (name, value) in head.headers {
        if name == TRANSFER_ENCODING || name == CONNECTION {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(output.into_body(leftover))
        .map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Reading side of one exchange. Holds the write half open until the
/// response is complete so the worker never sees a closed connection early.
struct WorkerOutput {
    reader: BufReader<OwnedReadHalf>,
    _writer: OwnedWriteHalf,
    identity: PathBuf,
    finished: bool,
}

impl WorkerOutput {
    /// Next non-empty stdout chunk, or `None` once the request has ended
    async fn next_stdout(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        while !self.finished {
            let record = match read_record(&mut self.reader).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    self.finished = true;
                    return Err(ProtocolError::Truncated);
                }
                Err(e) => {
                    self.finished = true;
                    return Err(e);
                }
            };

            match record.record_type {
                RecordType::Stdout if !record.content.is_empty() => return Ok(Some(record.content)),
                RecordType::Stdout => {}
                RecordType::Stderr => {
                    let text = String::from_utf8_lossy(&record.content);
                    for line in text.lines().filter(|l| !l.is_empty()) {
                        warn!(identity = %self.identity.display(), "worker stderr: {}", line);
                    }
                }
                RecordType::EndRequest => {
                    self.finished = true;
                    if record.content.len() >= 4 {
                        let app_status = u32::from_be_bytes([
                            record.content[0],
                            record.content[1],
                            record.content[2],
                            record.content[3],
                        ]);
                        debug!(identity = %self.identity.display(), app_status, "Worker ended request");
                    }
                }
                other => {
                    debug!(identity = %self.identity.display(), record_type = ?other, "Ignoring record from worker");
                }
            }
        }
        Ok(None)
    }

    /// Read stdout until the CGI header block is complete
    async fn read_head(&mut self) -> Result<(CgiHead, Bytes), ProtocolError> {
        let mut buf = Vec::new();
        loop {
            match self.next_stdout().await? {
                Some(chunk) => {
                    // A terminator may straddle the previous chunk boundary
                    let scan_from = buf.len().saturating_sub(3);
                    buf.extend_from_slice(&chunk);
                    if let Some((head, body_start)) = parse_cgi_head(&buf, scan_from)? {
                        return Ok((head, Bytes::from(buf).slice(body_start..)));
                    }
                }
                None if buf.is_empty() => return Err(ProtocolError::Truncated),
                None => {
                    return Err(ProtocolError::Malformed(
                        "response ended inside the header block".into(),
                    ));
                }
            }
        }
    }

    fn into_body(self, leftover: Bytes) -> GatewayBody {
        let stream = futures::stream::unfold((self, Some(leftover)), |(mut output, pending)| async move {
            if let Some(bytes) = pending.filter(|b| !b.is_empty()) {
                return Some((Ok(Frame::data(bytes)), (output, None)));
            }
            match output.next_stdout().await {
                Ok(Some(bytes)) => Some((Ok(Frame::data(bytes)), (output, None))),
                Ok(None) => None,
                Err(e) => {
                    warn!(identity = %output.identity.display(), error = %e, "Worker response cut short");
                    Some((Err(BoxError::from(e)), (output, None)))
                }
            }
        });
        StreamBody::new(stream).boxed_unsync()
    }
}
