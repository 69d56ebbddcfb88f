//! Buffered I/O streams for protocol communication.
//!
//! [`RfbInStream`] and [`RfbOutStream`] provide buffered reading and writing
//! with type-safe methods for primitive types in network byte order
//! (big-endian). Output is buffered until [`RfbOutStream::flush`] is called,
//! which is also what delimits an update cycle on the sending side.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Buffered input stream reading protocol data in network byte order.
pub struct RfbInStream<R> {
    reader: R,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> RfbInStream<R> {
    /// Create a new input stream with the default 8 KiB buffer.
    pub fn new(reader: R) -> Self {
        Self::with_capacity(reader, 8192)
    }

    /// Create a new input stream with the given buffer capacity.
    pub fn with_capacity(reader: R, capacity: usize) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Ensure at least `n` bytes are buffered, reading from the underlying
    /// reader as needed. Fails with `UnexpectedEof` if the stream ends first.
    async fn ensure_bytes(&mut self, n: usize) -> std::io::Result<()> {
        while self.buffer.len() < n {
            let bytes_read = self.reader.read_buf(&mut self.buffer).await?;
            if bytes_read == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("expected {} bytes, got {}", n, self.buffer.len()),
                ));
            }
        }
        Ok(())
    }

    /// Read a single byte.
    pub async fn read_u8(&mut self) -> std::io::Result<u8> {
        self.ensure_bytes(1).await?;
        Ok(self.buffer.get_u8())
    }

    /// Read a 16-bit unsigned integer.
    pub async fn read_u16(&mut self) -> std::io::Result<u16> {
        self.ensure_bytes(2).await?;
        Ok(self.buffer.get_u16())
    }

    /// Read a 32-bit unsigned integer.
    pub async fn read_u32(&mut self) -> std::io::Result<u32> {
        self.ensure_bytes(4).await?;
        Ok(self.buffer.get_u32())
    }

    /// Read a 64-bit unsigned integer.
    pub async fn read_u64(&mut self) -> std::io::Result<u64> {
        self.ensure_bytes(8).await?;
        Ok(self.buffer.get_u64())
    }

    /// Read a 32-bit signed integer.
    pub async fn read_i32(&mut self) -> std::io::Result<i32> {
        self.ensure_bytes(4).await?;
        Ok(self.buffer.get_i32())
    }

    /// Read exactly `buf.len()` bytes.
    pub async fn read_bytes(&mut self, buf: &mut [u8]) -> std::io::Result<()> {
        self.ensure_bytes(buf.len()).await?;
        self.buffer.copy_to_slice(buf);
        Ok(())
    }

    /// Skip `n` bytes.
    pub async fn skip(&mut self, n: usize) -> std::io::Result<()> {
        self.ensure_bytes(n).await?;
        self.buffer.advance(n);
        Ok(())
    }

    /// Number of bytes readable without performing I/O.
    pub fn available(&self) -> usize {
        self.buffer.len()
    }

    /// Get a mutable reference to the underlying reader.
    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    /// Consume the stream and return the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }
}

/// Buffered output stream writing protocol data in network byte order.
///
/// Data is buffered until [`flush`](Self::flush) is called; dropping the
/// stream without flushing loses buffered data.
pub struct RfbOutStream<W> {
    writer: W,
    buffer: BytesMut,
}

impl<W: AsyncWrite + Unpin> RfbOutStream<W> {
    /// Create a new output stream with the default 8 KiB buffer.
    pub fn new(writer: W) -> Self {
        Self::with_capacity(writer, 8192)
    }

    /// Create a new output stream with the given buffer capacity.
    pub fn with_capacity(writer: W, capacity: usize) -> Self {
        Self {
            writer,
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    /// Write a single byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buffer.put_u8(value);
    }

    /// Write a 16-bit unsigned integer.
    pub fn write_u16(&mut self, value: u16) {
        self.buffer.put_u16(value);
    }

    /// Write a 32-bit unsigned integer.
    pub fn write_u32(&mut self, value: u32) {
        self.buffer.put_u32(value);
    }

    /// Write a 64-bit unsigned integer.
    pub fn write_u64(&mut self, value: u64) {
        self.buffer.put_u64(value);
    }

    /// Write a 32-bit signed integer.
    pub fn write_i32(&mut self, value: i32) {
        self.buffer.put_i32(value);
    }

    /// Write a byte slice.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Flush all buffered data to the underlying writer.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            self.writer.write_all(&self.buffer).await?;
            self.buffer.clear();
        }
        self.writer.flush().await
    }

    /// Number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Get a mutable reference to the underlying writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Consume the stream and return the underlying writer. Buffered data is
    /// lost unless [`flush`](Self::flush) was called first.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_read_primitives() {
        let data = vec![
            42, // u8
            0x12, 0x34, // u16
            0xDE, 0xAD, 0xBE, 0xEF, // u32
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, // u64
            0xFF, 0xFF, 0xFF, 0xFE, // i32 = -2
        ];
        let mut stream = RfbInStream::new(Cursor::new(data));

        assert_eq!(stream.read_u8().await.unwrap(), 42);
        assert_eq!(stream.read_u16().await.unwrap(), 0x1234);
        assert_eq!(stream.read_u32().await.unwrap(), 0xDEADBEEF);
        assert_eq!(stream.read_u64().await.unwrap(), 0x0102030405060708);
        assert_eq!(stream.read_i32().await.unwrap(), -2);
    }

    #[tokio::test]
    async fn test_read_bytes_and_skip() {
        let data = vec![1, 2, 3, 4, 5];
        let mut stream = RfbInStream::new(Cursor::new(data));

        stream.skip(2).await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_bytes(&mut buf).await.unwrap();
        assert_eq!(buf, [3, 4]);
        assert_eq!(stream.read_u8().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_read_eof() {
        let mut stream = RfbInStream::new(Cursor::new(vec![1u8]));
        stream.read_u8().await.unwrap();
        let result = stream.read_u16().await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_write_round_trip() {
        let mut buffer = Vec::new();

        {
            let mut out = RfbOutStream::new(&mut buffer);
            out.write_u8(42);
            out.write_u16(0x1234);
            out.write_u32(0xDEADBEEF);
            out.write_u64(u64::MAX - 1);
            out.write_i32(-2);
            out.write_bytes(b"test");
            out.flush().await.unwrap();
        }

        let mut inp = RfbInStream::new(Cursor::new(&buffer));
        assert_eq!(inp.read_u8().await.unwrap(), 42);
        assert_eq!(inp.read_u16().await.unwrap(), 0x1234);
        assert_eq!(inp.read_u32().await.unwrap(), 0xDEADBEEF);
        assert_eq!(inp.read_u64().await.unwrap(), u64::MAX - 1);
        assert_eq!(inp.read_i32().await.unwrap(), -2);
        let mut buf = [0u8; 4];
        inp.read_bytes(&mut buf).await.unwrap();
        assert_eq!(&buf, b"test");
    }

    #[tokio::test]
    async fn test_buffered_counter() {
        let mut buffer = Vec::new();
        let mut stream = RfbOutStream::new(&mut buffer);

        assert_eq!(stream.buffered(), 0);
        stream.write_u8(1);
        stream.write_u64(7);
        assert_eq!(stream.buffered(), 9);
        stream.flush().await.unwrap();
        assert_eq!(stream.buffered(), 0);
    }
}
