use std::io;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

use crate::network::address::{parse_address, Network};
use crate::network::BoxedStream;
#[cfg(not(unix))]
use crate::AppError;
use crate::AppResult;

/// Accept source feeding an [`Application`](crate::network::Application).
///
/// Implemented by the TCP and Unix acceptors and by the TLS wrapper;
/// tests inject their own to drive the accept loop's error handling.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Waits for the next inbound connection, returning the stream and
    /// the peer address.
    async fn accept(&self) -> io::Result<(BoxedStream, String)>;

    /// Address the listener is bound to.
    fn local_addr(&self) -> String;
}

/// Binds a listener for a textual address (`host:port`, `tcp://…`,
/// `unix:///path`).
pub async fn bind(address: &str) -> AppResult<Box<dyn Listener>> {
    let (network, address) = parse_address(address)?;
    match network {
        Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
            Ok(Box::new(TcpAcceptor::bind(&address).await?))
        }
        #[cfg(unix)]
        Network::Unix => Ok(Box::new(UnixAcceptor::bind(&address)?)),
        #[cfg(not(unix))]
        Network::Unix => Err(AppError::InvalidAddress(format!(
            "unix sockets are not supported on this platform: {address}"
        ))),
    }
}

/// Dials a textual address, producing the plain stream for a session.
pub async fn dial(address: &str) -> AppResult<BoxedStream> {
    let (network, address) = parse_address(address)?;
    match network {
        Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
            Ok(Box::new(TcpStream::connect(&address).await?))
        }
        #[cfg(unix)]
        Network::Unix => Ok(Box::new(UnixStream::connect(&address).await?)),
        #[cfg(not(unix))]
        Network::Unix => Err(AppError::InvalidAddress(format!(
            "unix sockets are not supported on this platform: {address}"
        ))),
    }
}

/// TCP accept source.
pub struct TcpAcceptor {
    inner: TcpListener,
    local: String,
}

impl TcpAcceptor {
    pub async fn bind(address: &str) -> AppResult<Self> {
        let inner = TcpListener::bind(address).await?;
        let local = inner.local_addr()?.to_string();
        Ok(TcpAcceptor { inner, local })
    }
}

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        let (stream, peer) = self.inner.accept().await?;
        Ok((Box::new(stream), peer.to_string()))
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }
}

/// Unix-domain accept source.
#[cfg(unix)]
pub struct UnixAcceptor {
    inner: UnixListener,
    local: String,
}

#[cfg(unix)]
impl UnixAcceptor {
    pub fn bind(path: &str) -> AppResult<Self> {
        let inner = UnixListener::bind(path)?;
        Ok(UnixAcceptor {
            inner,
            local: path.to_string(),
        })
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for UnixAcceptor {
    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        // unix peers are unnamed; report the socket path
        let (stream, _) = self.inner.accept().await?;
        Ok((Box::new(stream), self.local.clone()))
    }

    fn local_addr(&self) -> String {
        self.local.clone()
    }
}
