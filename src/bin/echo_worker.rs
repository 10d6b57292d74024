//! Example FastCGI worker used by the integration tests
//!
//! Run with a socket path argument to listen there, or with no arguments to
//! accept on a listener inherited as stdin.
//!
//! Routes are picked by `PATH_INFO`, or by the executable's name when there
//! is none (`/calc.fcgi` behaves like `/any.fcgi/calc`):
//! - `/env`: the CGI environment, one `KEY=VALUE` per line
//! - `/calc`: sum of a `a+b+...` request body
//! - `/status/<code>`: empty response with that status
//! - `/big`: 200 KiB of output
//! - `/stderr`: a line on the FastCGI stderr stream, then a short body
//! - `/exit`: respond, then exit the process
//! - `/abort`: exit without responding
//! - anything else: echo the request body

use fcgi_gateway::error::ProtocolError;
use fcgi_gateway::fcgi::{read_request, Request, ResponseWriter};
use std::path::PathBuf;
use tokio::io::AsyncWrite;
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();

    let listener = match std::env::args().nth(1) {
        Some(path) => bind_socket(PathBuf::from(path))?,
        None => inherited_listener()?,
    };
    info!(pid = std::process::id(), "echo worker ready");

    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            match serve(stream).await {
                Ok(()) => {}
                // Readiness checks connect and hang up without a request
                Err(ProtocolError::Truncated) => {}
                Err(e) => warn!(error = %e, "request failed"),
            }
        });
    }
}

fn bind_socket(path: PathBuf) -> anyhow::Result<UnixListener> {
    match std::fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(UnixListener::bind(&path)?)
}

fn inherited_listener() -> anyhow::Result<UnixListener> {
    use std::os::fd::FromRawFd;

    // Descriptor 0 is the listening socket handed over by the gateway
    let listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(0) };
    listener.set_nonblocking(true)?;
    Ok(UnixListener::from_std(listener)?)
}

async fn serve(stream: UnixStream) -> Result<(), ProtocolError> {
    let (mut reader, writer) = stream.into_split();
    let request = read_request(&mut reader).await?;
    let route = route(&request);
    let mut response = ResponseWriter::new(writer, request.request_id);

    if route == "/abort" {
        info!("aborting mid-request");
        std::process::exit(1);
    }

    let exit_after = route == "/exit";
    match route.as_str() {
        "/env" => {
            let mut vars: Vec<_> = request.params.iter().collect();
            vars.sort();
            let body: String = vars.iter().map(|(k, v)| format!("{}={}\n", k, v)).collect();
            send(&mut response, "200 OK", body.as_bytes()).await?;
        }
        "/calc" => {
            let input = String::from_utf8_lossy(&request.stdin);
            let sum: i64 = input.split('+').filter_map(|n| n.trim().parse::<i64>().ok()).sum();
            send(&mut response, "200 OK", sum.to_string().as_bytes()).await?;
        }
        "/big" => {
            response.stdout(b"Content-Type: application/octet-stream\r\n\r\n").await?;
            let chunk = vec![b'x'; 1024];
            for _ in 0..200 {
                response.stdout(&chunk).await?;
            }
        }
        "/stderr" => {
            response.stderr(b"something went sideways\n").await?;
            send(&mut response, "200 OK", b"logged").await?;
        }
        other => match other.strip_prefix("/status/") {
            Some(code) => send(&mut response, code, b"").await?,
            None => echo(&mut response, &request).await?,
        },
    }

    response.finish(0).await?;
    if exit_after {
        info!("exiting on request");
        std::process::exit(0);
    }
    Ok(())
}

/// `PATH_INFO`, or `/<name>` for a bare `/<name>.fcgi` request
fn route(request: &Request) -> String {
    match request.params.get("PATH_INFO") {
        Some(path_info) if !path_info.is_empty() => path_info.clone(),
        _ => {
            let script = request.params.get("SCRIPT_NAME").map(String::as_str).unwrap_or("");
            let name = script.rsplit('/').next().unwrap_or("");
            format!("/{}", name.split('.').next().unwrap_or(""))
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(response: &mut ResponseWriter<W>, status: &str, body: &[u8]) -> std::io::Result<()> {
    let head = format!("Status: {}\r\nContent-Type: text/plain\r\n\r\n", status);
    response.stdout(head.as_bytes()).await?;
    response.stdout(body).await
}

async fn echo<W: AsyncWrite + Unpin>(response: &mut ResponseWriter<W>, request: &Request) -> std::io::Result<()> {
    let mut head = format!(
        "Content-Type: text/plain\r\nX-Worker-Pid: {}\r\nX-Method: {}\r\n",
        std::process::id(),
        request.params.get("REQUEST_METHOD").map(String::as_str).unwrap_or("")
    );
    if let Ok(greeting) = std::env::var("GREETING") {
        head.push_str(&format!("X-Greeting: {}\r\n", greeting));
    }
    head.push_str("\r\n");
    response.stdout(head.as_bytes()).await?;
    response.stdout(&request.stdin).await
}
