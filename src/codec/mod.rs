//! Message codecs.
//!
//! A [`Codec`] turns typed messages into bytes and back over a
//! [`ByteBuf`]. [`LengthFieldCodec`] wraps any payload codec with a
//! 4-byte big-endian length frame; [`simple`] provides the string and
//! raw-bytes payload codecs.

use crate::buf::ByteBuf;
use crate::AppResult;

pub use length::{LengthFieldCodec, LengthFieldOptions, DEFAULT_MAX_BODY_SIZE};
pub use simple::{BytesCodec, StringCodec};

mod length;
mod simple;

/// Encode/decode pair for one message shape in each direction.
pub trait Codec: Send + Sync {
    type In: Send + 'static;
    type Out: Send + 'static;

    /// Encodes `msg` into `out`. The caller drains `out` to the
    /// connection afterwards.
    fn encode(&self, msg: &Self::Out, out: &mut ByteBuf) -> AppResult<()>;

    /// Decodes one message from `src`. `Ok(None)` means more bytes are
    /// needed, and no bytes may have been consumed; `Ok(Some(_))` means
    /// exactly one frame was consumed.
    fn decode(&self, src: &mut ByteBuf) -> AppResult<Option<Self::In>>;
}
