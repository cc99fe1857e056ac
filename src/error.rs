use std::borrow::Cow;
use std::io;

use tokio::time::error::Elapsed;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("illegal state: {0}")]
    IllegalState(Cow<'static, str>),

    #[error("connect is disabled on a server-owned session")]
    ConnectDisabled,

    #[error("session is busy: {0}")]
    Busy(&'static str),

    #[error("session closed")]
    SessionClosed,

    /// The peer closed the connection cleanly.
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("invalid frame length {0}")]
    InvalidFrameLength(i32),

    #[error("frame length {0} exceeds max body size {1}")]
    FrameTooLarge(i32, usize),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("tls error: {0}")]
    Tls(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("timeout")]
    Timeout(#[from] Elapsed),
}
