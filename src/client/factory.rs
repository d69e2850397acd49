//! Backend connection factories.

use std::future::Future;
use std::io;
use std::str::FromStr;
use std::time::Duration;

#[cfg(unix)]
use std::path::PathBuf;

use thiserror::Error;
use tokio::net::TcpStream;

use crate::client::connection::BackendConnection;

/// Produces fresh backend connections.
///
/// Shared by every request task, so implementations synchronize
/// internally.
pub trait ClientFactory: Send + Sync + 'static {
    fn new_connection(&self) -> impl Future<Output = Result<BackendConnection, DialError>> + Send;
}

/// Failure to establish a backend connection.
#[derive(Debug, Error)]
pub enum DialError {
    /// Connection refused, unreachable host or similar.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The connect deadline elapsed.
    #[error("timed out connecting to {address} after {after:?}")]
    Timeout { address: String, after: Duration },
}

impl DialError {
    /// The backend that could not be reached.
    pub fn address(&self) -> &str {
        match self {
            DialError::Connect { address, .. } | DialError::Timeout { address, .. } => address,
        }
    }
}

/// Where the backend listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendAddress {
    /// `host:port`, resolved at dial time.
    Tcp(String),
    #[cfg(unix)]
    Unix(PathBuf),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("backend address is empty")]
    Empty,

    #[error("backend address '{0}' must be host:port")]
    MissingPort(String),

    #[error("unsupported backend address scheme in '{0}'")]
    UnsupportedScheme(String),
}

impl FromStr for BackendAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }

        if let Some(path) = s.strip_prefix("unix:") {
            #[cfg(unix)]
            {
                let path = path.strip_prefix("//").unwrap_or(path);
                if path.is_empty() {
                    return Err(AddressError::Empty);
                }
                return Ok(BackendAddress::Unix(PathBuf::from(path)));
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return Err(AddressError::UnsupportedScheme(s.to_string()));
            }
        }

        let authority = match s.split_once("://") {
            Some(("tcp", rest)) => rest,
            Some(_) => return Err(AddressError::UnsupportedScheme(s.to_string())),
            None => s,
        };
        match authority.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(BackendAddress::Tcp(authority.to_string()))
            }
            _ => Err(AddressError::MissingPort(s.to_string())),
        }
    }
}

impl std::fmt::Display for BackendAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendAddress::Tcp(addr) => write!(f, "tcp://{}", addr),
            #[cfg(unix)]
            BackendAddress::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Dials a new transport for every request. No retries.
#[derive(Debug, Clone)]
pub struct DialFactory {
    address: BackendAddress,
    connect_timeout: Duration,
}

impl DialFactory {
    pub fn new(address: BackendAddress, connect_timeout: Duration) -> Self {
        Self {
            address,
            connect_timeout,
        }
    }

    pub fn address(&self) -> &BackendAddress {
        &self.address
    }

    async fn dial(&self) -> io::Result<BackendConnection> {
        let peer = self.address.to_string();
        match &self.address {
            BackendAddress::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(BackendConnection::new(stream, peer))
            }
            #[cfg(unix)]
            BackendAddress::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(BackendConnection::new(stream, peer))
            }
        }
    }
}

impl ClientFactory for DialFactory {
    async fn new_connection(&self) -> Result<BackendConnection, DialError> {
        match tokio::time::timeout(self.connect_timeout, self.dial()).await {
            Ok(Ok(connection)) => {
                tracing::debug!(
                    backend = %self.address,
                    connection_id = %connection.id(),
                    "Connected to backend"
                );
                Ok(connection)
            }
            Ok(Err(source)) => Err(DialError::Connect {
                address: self.address.to_string(),
                source,
            }),
            Err(_) => Err(DialError::Timeout {
                address: self.address.to_string(),
                after: self.connect_timeout,
            }),
        }
    }
}
