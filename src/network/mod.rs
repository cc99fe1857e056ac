//! Connection-oriented transport runtime.
//!
//! The module is built on tokio's async I/O primitives and consists of:
//! - [`Session`]: a stateful, reference-counted wrapper over one stream
//!   connection, driving a codec over paired read/write buffers
//! - [`Application`]: the listening server owning accept loops and a
//!   sharded session registry
//! - [`Listener`] implementations for TCP and Unix sockets, plus a TLS
//!   wrapper
//! - [`parse_address`]: the textual address grammar shared by listeners
//!   and dialers

pub use address::{parse_address, Network};
pub use application::{
    AppOptions, Application, MessageHandleFn, SessionHandleFn, DEFAULT_SESSION_BUCKET_SIZE,
};
#[cfg(unix)]
pub use listener::UnixAcceptor;
pub use listener::{bind, dial, Listener, TcpAcceptor};
pub use session::{
    DialFn, ReadOptions, ReleaseFn, Session, SessionAware, SessionOptions, SessionState,
    WriteOptions, DEFAULT_READ_BUF_SIZE, DEFAULT_WRITE_BUF_SIZE,
};
pub use tls::{client_config, server_config, tls_dialer, TlsListener, TlsOptions};

use tokio::io::{AsyncRead, AsyncWrite};

mod address;
mod application;
mod listener;
mod session;
mod tls;

/// Object-safe byte stream: TCP, Unix-domain, TLS and in-memory test
/// streams all erase to this.
pub trait IO: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> IO for T {}

/// Boxed stream handed between listeners, dialers and sessions.
pub type BoxedStream = Box<dyn IO>;
