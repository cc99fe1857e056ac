use getset::CopyGetters;

use crate::buf::ByteBuf;
use crate::codec::Codec;
use crate::{AppError, AppResult};

const LENGTH_FIELD_SIZE: usize = 4;

/// Default cap on a decoded body, 10 MiB.
pub const DEFAULT_MAX_BODY_SIZE: usize = 1024 * 1024 * 10;

/// Framing parameters for [`LengthFieldCodec`].
///
/// The frame layout is
/// `[initial_bytes_to_strip][length_field_offset][4-byte length][body]`;
/// `length_adjustment` corrects the skip for protocols whose length
/// field covers more than the body.
#[derive(Debug, Clone, Copy, CopyGetters)]
#[get_copy = "pub"]
pub struct LengthFieldOptions {
    length_field_offset: usize,
    length_adjustment: isize,
    initial_bytes_to_strip: usize,
    max_body_size: usize,
}

impl Default for LengthFieldOptions {
    fn default() -> Self {
        LengthFieldOptions {
            length_field_offset: 0,
            length_adjustment: 0,
            initial_bytes_to_strip: 0,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl LengthFieldOptions {
    pub fn with_length_field_offset(mut self, value: usize) -> Self {
        self.length_field_offset = value;
        self
    }

    pub fn with_length_adjustment(mut self, value: isize) -> Self {
        self.length_adjustment = value;
        self
    }

    pub fn with_initial_bytes_to_strip(mut self, value: usize) -> Self {
        self.initial_bytes_to_strip = value;
        self
    }

    pub fn with_max_body_size(mut self, value: usize) -> Self {
        self.max_body_size = value;
        self
    }
}

/// Wraps an inner payload codec with a 4-byte big-endian length frame.
///
/// Decode marks the body region and delegates to the inner codec, which
/// must consume exactly the marked bytes. Encode reserves the length
/// slot, delegates, then backfills the written length.
pub struct LengthFieldCodec<C> {
    inner: C,
    options: LengthFieldOptions,
}

impl<C> LengthFieldCodec<C> {
    pub fn new(inner: C) -> Self {
        Self::with_options(inner, LengthFieldOptions::default())
    }

    pub fn with_options(inner: C, options: LengthFieldOptions) -> Self {
        LengthFieldCodec { inner, options }
    }
}

impl<C: Codec> Codec for LengthFieldCodec<C> {
    type In = C::In;
    type Out = C::Out;

    fn decode(&self, src: &mut ByteBuf) -> AppResult<Option<Self::In>> {
        let opts = &self.options;
        let readable = src.readable();

        let header = opts.initial_bytes_to_strip + opts.length_field_offset + LENGTH_FIELD_SIZE;
        if readable < header {
            return Ok(None);
        }

        let length = src.peek_i32(opts.initial_bytes_to_strip + opts.length_field_offset);
        if length <= 0 {
            return Err(AppError::InvalidFrameLength(length));
        }
        if length as usize > opts.max_body_size {
            return Err(AppError::FrameTooLarge(length, opts.max_body_size));
        }

        let skip = (header as isize + opts.length_adjustment) as usize;
        if readable < skip + length as usize {
            return Ok(None);
        }

        src.skip(skip);
        src.set_mark_index(src.read_index() + length as usize);
        self.inner.decode(src)
    }

    fn encode(&self, msg: &Self::Out, out: &mut ByteBuf) -> AppResult<()> {
        let old_index = out.write_index();
        out.grow(LENGTH_FIELD_SIZE);
        out.set_write_index(old_index + LENGTH_FIELD_SIZE);

        self.inner.encode(msg, out)?;

        let new_index = out.write_index();
        out.set_write_index(old_index);
        out.write_i32((new_index - old_index - LENGTH_FIELD_SIZE) as i32);
        out.set_write_index(new_index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::codec::BytesCodec;

    #[test]
    fn test_encode() {
        let codec = LengthFieldCodec::new(BytesCodec);
        let mut buf = ByteBuf::new(32);

        codec.encode(&Bytes::from_static(b"hello"), &mut buf).unwrap();
        codec.encode(&Bytes::from_static(b"world"), &mut buf).unwrap();
        assert_eq!(18, buf.readable());

        assert_eq!(5, buf.read_i32());
        assert_eq!(b"hello", buf.read_bytes(5).as_slice());
        assert_eq!(5, buf.read_i32());
        assert_eq!(b"world", buf.read_bytes(5).as_slice());
    }

    #[test]
    fn test_decode_two_frames_in_one_feed() {
        let codec = LengthFieldCodec::new(BytesCodec);
        let mut buf = ByteBuf::new(32);
        buf.write_i32(5);
        buf.write_str("hello");
        buf.write_i32(5);
        buf.write_str("world");

        assert_eq!(
            Some(Bytes::from_static(b"hello")),
            codec.decode(&mut buf).unwrap()
        );
        assert_eq!(
            Some(Bytes::from_static(b"world")),
            codec.decode(&mut buf).unwrap()
        );
        assert_eq!(0, buf.readable());
    }

    #[test]
    fn test_decode_split_feed() {
        let codec = LengthFieldCodec::new(BytesCodec);
        let mut buf = ByteBuf::new(32);

        // first chunk ends in the middle of the second frame's header
        buf.write_i32(5);
        buf.write_str("hello");
        buf.write(&[0x00, 0x00]);

        assert_eq!(
            Some(Bytes::from_static(b"hello")),
            codec.decode(&mut buf).unwrap()
        );
        assert_eq!(None, codec.decode(&mut buf).unwrap());

        buf.write(&[0x00, 0x05]);
        buf.write_str("world");
        assert_eq!(
            Some(Bytes::from_static(b"world")),
            codec.decode(&mut buf).unwrap()
        );
        assert_eq!(0, buf.readable());
    }

    #[test]
    fn test_decode_incomplete_consumes_nothing() {
        let codec = LengthFieldCodec::new(BytesCodec);
        let mut buf = ByteBuf::new(32);
        buf.write_i32(5);
        buf.write_str("hel");

        assert_eq!(None, codec.decode(&mut buf).unwrap());
        assert_eq!(0, buf.read_index());
        assert_eq!(8, buf.readable());
    }

    #[test]
    fn test_decode_rejects_zero_length() {
        let codec = LengthFieldCodec::new(BytesCodec);
        let mut buf = ByteBuf::new(32);
        buf.write_i32(0);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, AppError::InvalidFrameLength(0)));
        assert_eq!(0, buf.read_index());
    }

    #[test]
    fn test_decode_rejects_oversized_body() {
        let codec = LengthFieldCodec::with_options(
            BytesCodec,
            LengthFieldOptions::default().with_max_body_size(4),
        );
        let mut buf = ByteBuf::new(32);
        buf.write_i32(5);
        buf.write_str("hello");

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, AppError::FrameTooLarge(5, 4)));
        assert_eq!(0, buf.read_index());
    }

    #[test]
    fn test_decode_with_offsets() {
        let codec = LengthFieldCodec::with_options(
            BytesCodec,
            LengthFieldOptions::default()
                .with_initial_bytes_to_strip(1)
                .with_length_field_offset(2),
        );
        let mut buf = ByteBuf::new(32);
        buf.write_byte(0xAA);
        buf.write(&[0xBB, 0xCC]);
        buf.write_i32(3);
        buf.write_str("abc");

        assert_eq!(
            Some(Bytes::from_static(b"abc")),
            codec.decode(&mut buf).unwrap()
        );
        assert_eq!(0, buf.readable());
    }
}
