//! Producing the single connected stream an endpoint chats over.
//!
//! The client side resolves and connects; the server side binds, listens and
//! accepts exactly one peer. Either way the result is a plain [`TcpStream`]
//! and any failure is final for the run: nothing here retries.

use std::{
    fmt, io,
    net::{IpAddr, SocketAddr},
};

use tokio::net::{TcpListener, TcpSocket, TcpStream, lookup_host};
use tracing::{debug, info};

/// Pending connections the kernel may queue before `accept`.
const LISTEN_BACKLOG: u32 = 3;

/// Why an endpoint could not get a connection.
///
/// `InvalidAddress` and `Connect` are the two client-side failures and are
/// deliberately separate so the operator can tell a typo from a server that
/// is not running. The rest belong to the server side.
#[derive(Debug)]
pub enum EstablishError {
    /// The host is neither an IP literal nor a resolvable hostname.
    InvalidAddress { host: String },
    /// Every resolved address refused the connection or was unreachable.
    Connect { target: String, source: io::Error },
    /// The socket could not be created or configured.
    Socket(io::Error),
    /// The port could not be claimed, usually because it is in use.
    Bind { addr: SocketAddr, source: io::Error },
    /// The bound socket could not enter the listening state.
    Listen(io::Error),
    /// Waiting for the peer failed.
    Accept(io::Error),
}

impl EstablishError {
    /// A suggested remedy to show next to the error.
    pub fn hint(&self) -> String {
        match self {
            EstablishError::InvalidAddress { .. } => {
                "use an IPv4/IPv6 address such as 127.0.0.1 or a valid hostname".to_string()
            }
            EstablishError::Connect { .. } => "the server may not be running, the address or port \
                 may be wrong, or a firewall may be blocking it; start the server first and retry"
                .to_string(),
            EstablishError::Socket(_) => {
                "system resources may be exhausted; close other programs and retry".to_string()
            }
            EstablishError::Bind { addr, .. } => format!(
                "port {} may already be in use; run `lsof -i :{}` to find the process, \
                 stop it or choose another port",
                addr.port(),
                addr.port()
            ),
            EstablishError::Listen(_) => {
                "check the socket limits of this system and restart the server".to_string()
            }
            EstablishError::Accept(_) => "restart the server and connect again".to_string(),
        }
    }
}

impl fmt::Display for EstablishError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstablishError::InvalidAddress { host } => write!(f, "invalid address: {host}"),
            EstablishError::Connect { target, source } => {
                write!(f, "failed to connect to {target}: {source}")
            }
            EstablishError::Socket(err) => write!(f, "failed to create socket: {err}"),
            EstablishError::Bind { addr, source } => write!(f, "failed to bind {addr}: {source}"),
            EstablishError::Listen(err) => write!(f, "failed to listen: {err}"),
            EstablishError::Accept(err) => write!(f, "failed to accept peer: {err}"),
        }
    }
}

impl std::error::Error for EstablishError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EstablishError::InvalidAddress { .. } => None,
            EstablishError::Connect { source, .. } | EstablishError::Bind { source, .. } => {
                Some(source)
            }
            EstablishError::Socket(err) | EstablishError::Listen(err) | EstablishError::Accept(err) => {
                Some(err)
            }
        }
    }
}

/// Resolve `host` and open a connection to the first address that answers.
pub async fn connect(host: &str, port: u16) -> Result<TcpStream, EstablishError> {
    let target = format!("{host}:{port}");
    let mut last_error = None;

    for addr in resolve(host, port).await? {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                info!(%addr, "connected");
                return Ok(stream);
            }
            Err(err) => {
                debug!(%addr, error = %err, "connect attempt failed");
                last_error = Some(err);
            }
        }
    }

    let source = last_error.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable));
    Err(EstablishError::Connect { target, source })
}

async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, EstablishError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }

    let invalid = || EstablishError::InvalidAddress {
        host: host.to_string(),
    };
    if !is_hostname(host) {
        return Err(invalid());
    }

    let addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|_| invalid())?
        .collect();
    if addrs.is_empty() {
        return Err(invalid());
    }
    Ok(addrs)
}

fn is_hostname(host: &str) -> bool {
    !host.is_empty()
        && host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        })
}

/// A listening socket that hands out exactly one connection.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Claim `host:port` with address reuse enabled and start listening.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(host: &str, port: u16) -> Result<Self, EstablishError> {
        let ip = host
            .parse::<IpAddr>()
            .map_err(|_| EstablishError::InvalidAddress {
                host: host.to_string(),
            })?;
        let addr = SocketAddr::new(ip, port);

        let socket = match ip {
            IpAddr::V4(_) => TcpSocket::new_v4(),
            IpAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(EstablishError::Socket)?;
        // Lets a restarted server reclaim a port still in TIME_WAIT.
        socket.set_reuseaddr(true).map_err(EstablishError::Socket)?;
        socket
            .bind(addr)
            .map_err(|source| EstablishError::Bind { addr, source })?;
        let inner = socket.listen(LISTEN_BACKLOG).map_err(EstablishError::Listen)?;

        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Block until one peer connects. The listening socket is closed on
    /// return, so later connection attempts are refused.
    pub async fn accept_one(self) -> Result<(TcpStream, SocketAddr), EstablishError> {
        let (stream, peer) = self.inner.accept().await.map_err(EstablishError::Accept)?;
        info!(%peer, "peer connected");
        Ok((stream, peer))
    }
}
