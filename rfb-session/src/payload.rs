//! Inner-payload framing on the wire.
//!
//! Raw payloads have a size implied by the rectangle geometry (canonical
//! 32bpp, so `width * height * 4` bytes). Compressed payloads (zlib, the
//! JPEG-over-Tight path) carry an explicit 4-byte length, the way the
//! standard zlib encoding frames its data. Session init messages and
//! plain (non-cache) rectangles use the same framing.

use crate::error::SessionError;
use rfb_cache::Codec;
use rfb_protocol::io::{RfbInStream, RfbOutStream};
use rfb_protocol::messages::cache::MAX_INIT_PAYLOAD_LEN;
use rfb_protocol::messages::types::{ENCODING_RAW, ENCODING_TIGHT, ENCODING_ZLIB};
use tokio::io::{AsyncRead, AsyncWrite};

/// Read one inner payload for the given encoding and rectangle geometry.
pub async fn read_payload<R: AsyncRead + Unpin>(
    stream: &mut RfbInStream<R>,
    encoding: i32,
    width: u16,
    height: u16,
) -> Result<Vec<u8>, SessionError> {
    match encoding {
        ENCODING_RAW => {
            let len = width as usize * height as usize * 4;
            let mut payload = vec![0u8; len];
            stream.read_bytes(&mut payload).await?;
            Ok(payload)
        }
        ENCODING_ZLIB | ENCODING_TIGHT => {
            let len = stream.read_u32().await?;
            if len > MAX_INIT_PAYLOAD_LEN {
                return Err(SessionError::Protocol(format!(
                    "payload length {} exceeds limit {}",
                    len, MAX_INIT_PAYLOAD_LEN
                )));
            }
            let mut payload = vec![0u8; len as usize];
            stream.read_bytes(&mut payload).await?;
            Ok(payload)
        }
        other => Err(SessionError::Protocol(format!(
            "unsupported inner encoding {}",
            other
        ))),
    }
}

/// Write one inner payload with the framing matching its codec.
pub fn write_payload<W: AsyncWrite + Unpin>(
    out: &mut RfbOutStream<W>,
    codec: &Codec,
    payload: &[u8],
) {
    match codec {
        Codec::Raw => out.write_bytes(payload),
        Codec::Zlib { .. } | Codec::Jpeg { .. } => {
            out.write_u32(payload.len() as u32);
            out.write_bytes(payload);
        }
    }
}

/// Bytes the framing itself adds on top of the payload.
pub fn framing_overhead(codec: &Codec) -> u64 {
    match codec {
        Codec::Raw => 0,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_raw_framing_round_trip() {
        let codec = Codec::Raw;
        let data = vec![7u8; 2 * 2 * 4];

        let mut wire = Vec::new();
        let mut out = RfbOutStream::new(&mut wire);
        write_payload(&mut out, &codec, &data);
        out.flush().await.unwrap();
        assert_eq!(wire.len(), data.len());

        let mut inp = RfbInStream::new(Cursor::new(wire));
        let read = read_payload(&mut inp, codec.encoding_id(), 2, 2).await.unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_zlib_framing_round_trip() {
        let codec = Codec::Zlib { level: 6 };
        let data = vec![1u8, 2, 3, 4, 5];

        let mut wire = Vec::new();
        let mut out = RfbOutStream::new(&mut wire);
        write_payload(&mut out, &codec, &data);
        out.flush().await.unwrap();
        assert_eq!(wire.len(), 4 + data.len());

        let mut inp = RfbInStream::new(Cursor::new(wire));
        let read = read_payload(&mut inp, codec.encoding_id(), 64, 64).await.unwrap();
        assert_eq!(read, data);
    }

    #[tokio::test]
    async fn test_oversize_length_rejected() {
        let mut wire = Vec::new();
        let mut out = RfbOutStream::new(&mut wire);
        out.write_u32(MAX_INIT_PAYLOAD_LEN + 1);
        out.flush().await.unwrap();

        let mut inp = RfbInStream::new(Cursor::new(wire));
        let result = read_payload(&mut inp, ENCODING_ZLIB, 1, 1).await;
        assert!(matches!(result, Err(SessionError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_unknown_encoding_rejected() {
        let mut inp = RfbInStream::new(Cursor::new(Vec::new()));
        assert!(read_payload(&mut inp, 99, 1, 1).await.is_err());
    }
}
