use bytes::Bytes;

use crate::buf::ByteBuf;
use crate::codec::Codec;
use crate::{AppError, AppResult};

/// UTF-8 string payloads; designed to sit under
/// [`LengthFieldCodec`](super::LengthFieldCodec), which marks the body
/// region before delegating.
#[derive(Debug, Default, Clone, Copy)]
pub struct StringCodec;

impl Codec for StringCodec {
    type In = String;
    type Out = String;

    fn encode(&self, msg: &String, out: &mut ByteBuf) -> AppResult<()> {
        out.write_str(msg);
        Ok(())
    }

    fn decode(&self, src: &mut ByteBuf) -> AppResult<Option<String>> {
        let data = src.read_marked();
        let value = String::from_utf8(data).map_err(|e| AppError::Codec(e.to_string()))?;
        Ok(Some(value))
    }
}

/// Raw byte payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type In = Bytes;
    type Out = Bytes;

    fn encode(&self, msg: &Bytes, out: &mut ByteBuf) -> AppResult<()> {
        out.write(msg.as_ref());
        Ok(())
    }

    fn decode(&self, src: &mut ByteBuf) -> AppResult<Option<Bytes>> {
        Ok(Some(Bytes::from(src.read_marked())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::LengthFieldCodec;

    #[test]
    fn test_string_round_trip() {
        let codec = LengthFieldCodec::new(StringCodec);
        let mut buf = ByteBuf::new(32);

        codec.encode(&"hello".to_string(), &mut buf).unwrap();
        assert_eq!(Some("hello".to_string()), codec.decode(&mut buf).unwrap());
        assert_eq!(0, buf.readable());
    }

    #[test]
    fn test_string_rejects_invalid_utf8() {
        let codec = LengthFieldCodec::new(StringCodec);
        let mut buf = ByteBuf::new(32);
        buf.write_i32(2);
        buf.write(&[0xFF, 0xFE]);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, AppError::Codec(_)));
    }

    #[test]
    fn test_bytes_round_trip() {
        let codec = LengthFieldCodec::new(BytesCodec);
        let mut buf = ByteBuf::new(32);

        codec
            .encode(&Bytes::from_static(&[1, 2, 3]), &mut buf)
            .unwrap();
        assert_eq!(
            Some(Bytes::from_static(&[1, 2, 3])),
            codec.decode(&mut buf).unwrap()
        );
    }
}
