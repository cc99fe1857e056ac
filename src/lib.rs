//! framewire — a length-framed TCP/Unix-socket transport library.
//!
//! An application supplies a message [`Codec`] and a per-message
//! handler; the library accepts connections, reads framed messages,
//! dispatches them, writes encoded replies and manages every
//! connection's lifecycle under concurrent close, disconnect and
//! failure conditions.
//!
//! The building blocks:
//! - [`buf::ByteBuf`]: growing byte buffer with reader/writer/mark
//!   indices and a pluggable allocator
//! - [`codec::LengthFieldCodec`]: 4-byte big-endian length framing
//!   around a user payload codec
//! - [`network::Session`]: stateful, reference-counted connection
//!   wrapper with per-call deadlines
//! - [`network::Application`]: the listening server with a sharded
//!   session registry and graceful shutdown
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use framewire::codec::{LengthFieldCodec, StringCodec};
//! use framewire::network::{AppOptions, Application, MessageHandleFn, ReadOptions, WriteOptions};
//! use framewire::{AppResult, Session, SessionOptions};
//!
//! type Echo = LengthFieldCodec<StringCodec>;
//!
//! #[tokio::main]
//! async fn main() -> AppResult<()> {
//!     let handle: MessageHandleFn<Echo> = Arc::new(|session, msg, _sequence| {
//!         Box::pin(async move { session.write(msg, WriteOptions::default()).await })
//!     });
//!     let app = Application::bind(
//!         "127.0.0.1:9527",
//!         handle,
//!         AppOptions::new(LengthFieldCodec::new(StringCodec)),
//!     )
//!     .await?;
//!     app.start()?;
//!
//!     let client = Session::new(SessionOptions::new(LengthFieldCodec::new(StringCodec)));
//!     client.connect("127.0.0.1:9527", Some(Duration::from_secs(1))).await?;
//!     client.write("hello".to_string(), WriteOptions::default()).await?;
//!     let reply = client.read(ReadOptions::default()).await?;
//!     assert_eq!("hello", reply);
//!
//!     client.close()?;
//!     app.stop().await
//! }
//! ```

pub mod buf;
pub mod codec;
pub mod network;

mod error;

pub use buf::{Allocator, ByteBuf};
pub use codec::Codec;
pub use error::{AppError, AppResult};
pub use network::{
    AppOptions, Application, ReadOptions, Session, SessionAware, SessionOptions, SessionState,
    WriteOptions,
};
