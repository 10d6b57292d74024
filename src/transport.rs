//! Worker transports
//!
//! A worker is reached either through a named socket it created itself, or
//! through a listener the gateway bound and handed to it on stdin.

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::net::UnixStream;
use tracing::debug;

/// Address a worker accepts connections on
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// A socket file on disk
    Path(PathBuf),
    /// A Linux abstract-namespace name (without the leading NUL)
    #[cfg(target_os = "linux")]
    Abstract(String),
}

impl Endpoint {
    /// Open a fresh connection to the worker
    pub async fn connect(&self) -> io::Result<UnixStream> {
        match self {
            Endpoint::Path(path) => UnixStream::connect(path).await,
            #[cfg(target_os = "linux")]
            Endpoint::Abstract(name) => {
                let name = name.clone();
                let stream = tokio::task::spawn_blocking(move || connect_abstract(&name))
                    .await
                    .map_err(io::Error::other)??;
                UnixStream::from_std(stream)
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn connect_abstract(name: &str) -> io::Result<std::os::unix::net::UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    let stream = std::os::unix::net::UnixStream::connect_addr(&addr)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Path(path) => write!(f, "{}", path.display()),
            #[cfg(target_os = "linux")]
            Endpoint::Abstract(name) => write!(f, "@{}", name),
        }
    }
}

/// Transport resource owned by a registered worker. Released exactly once,
/// by whoever retires the worker.
#[derive(Debug)]
pub enum Transport {
    /// The worker listens on this socket path (passed as its only argument)
    NamedSocket(PathBuf),
    /// The gateway binds this listener and a duplicate of its descriptor
    /// becomes the worker's stdin. The gateway's copy is closed once the
    /// worker has started, so only the worker keeps the socket alive.
    InheritedListener {
        endpoint: Endpoint,
        listener: Option<UnixListener>,
    },
}

impl Transport {
    /// Bind a listener that is not visible in the worker or socket
    /// directories. `name` only needs to be unique within this gateway.
    pub fn bind_inherited(name: &str) -> io::Result<Self> {
        // sun_path holds 108 bytes
        let name: String = name.chars().take(40).collect();
        let unique = format!(
            "fcgi-gateway/{}/{}.{}.sock",
            std::process::id(),
            name,
            uuid::Uuid::new_v4().simple()
        );
        let (endpoint, listener) = bind_unnamed(unique)?;
        debug!(%endpoint, "Bound inherited listener");
        Ok(Transport::InheritedListener {
            endpoint,
            listener: Some(listener),
        })
    }

    pub fn endpoint(&self) -> Endpoint {
        match self {
            Transport::NamedSocket(path) => Endpoint::Path(path.clone()),
            Transport::InheritedListener { endpoint, .. } => endpoint.clone(),
        }
    }

    /// Stdin for the child process: the inherited listener, or nothing
    pub fn child_stdin(&self) -> io::Result<Stdio> {
        match self {
            Transport::NamedSocket(_) => Ok(Stdio::null()),
            Transport::InheritedListener {
                listener: Some(listener),
                ..
            } => {
                let fd: OwnedFd = listener.try_clone()?.into();
                Ok(Stdio::from(fd))
            }
            Transport::InheritedListener { listener: None, .. } => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener already handed to a worker",
            )),
        }
    }

    /// Close the gateway's copy of an inherited listener. Afterwards a
    /// connection succeeds only while the worker holds the descriptor, and
    /// fails once it has exited.
    pub fn hand_over(&mut self) {
        if let Transport::InheritedListener { endpoint, listener } = self {
            if listener.take().is_some() {
                debug!(%endpoint, "Closed gateway copy of inherited listener");
            }
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Transport::NamedSocket(_) => "socket",
            Transport::InheritedListener { .. } => "stdin",
        }
    }

    /// Release the transport. A socket file that is already gone is not an error.
    pub fn release(self) -> io::Result<()> {
        match self {
            Transport::NamedSocket(path) => remove_socket_file(path),
            Transport::InheritedListener { endpoint, listener } => {
                drop(listener);
                match endpoint {
                    Endpoint::Path(path) => remove_socket_file(path),
                    #[cfg(target_os = "linux")]
                    Endpoint::Abstract(_) => Ok(()),
                }
            }
        }
    }
}

fn remove_socket_file(path: PathBuf) -> io::Result<()> {
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(target_os = "linux")]
fn bind_unnamed(name: String) -> io::Result<(Endpoint, UnixListener)> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::SocketAddr;

    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    let listener = UnixListener::bind_addr(&addr)?;
    Ok((Endpoint::Abstract(name), listener))
}

#[cfg(not(target_os = "linux"))]
fn bind_unnamed(name: String) -> io::Result<(Endpoint, UnixListener)> {
    let path = std::env::temp_dir().join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&path)?;
    Ok((Endpoint::Path(path), listener))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_named_socket_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.fcgi.sock");
        std::fs::write(&path, "").unwrap();

        Transport::NamedSocket(path.clone()).release().unwrap();
        assert!(!path.exists());

        // Already removed: still fine
        Transport::NamedSocket(path).release().unwrap();
    }

    #[tokio::test]
    async fn test_inherited_listener_accepts_connections() {
        let transport = Transport::bind_inherited("app.fcgi").unwrap();
        let endpoint = transport.endpoint();
        assert_eq!(transport.mode(), "stdin");

        let stream = endpoint.connect().await;
        assert!(stream.is_ok(), "connect to {} failed: {:?}", endpoint, stream.err());

        transport.release().unwrap();
        assert!(endpoint.connect().await.is_err());
    }

    #[tokio::test]
    async fn test_handed_over_listener_lives_only_in_the_child_copy() {
        let mut transport = Transport::bind_inherited("app.fcgi").unwrap();
        let endpoint = transport.endpoint();

        // Stands in for the descriptor a started worker holds
        let child_copy = transport.child_stdin().unwrap();
        transport.hand_over();
        assert!(transport.child_stdin().is_err());

        assert!(endpoint.connect().await.is_ok(), "worker copy keeps accepting");

        drop(child_copy);
        assert!(
            endpoint.connect().await.is_err(),
            "no listener left once the worker's copy is gone"
        );
        transport.release().unwrap();
    }

    #[tokio::test]
    async fn test_inherited_listener_names_are_unique() {
        let a = Transport::bind_inherited("same.fcgi").unwrap();
        let b = Transport::bind_inherited("same.fcgi").unwrap();
        assert_ne!(a.endpoint(), b.endpoint());
        a.release().unwrap();
        b.release().unwrap();
    }

    #[test]
    fn test_child_stdin_for_named_socket_is_null() {
        let transport = Transport::NamedSocket(PathBuf::from("/tmp/unused.sock"));
        assert!(transport.child_stdin().is_ok());
        assert_eq!(transport.mode(), "socket");
    }
}
