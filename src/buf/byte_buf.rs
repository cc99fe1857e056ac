use std::fmt;
use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::allocator::{default_allocator, Allocator};

pub const DEFAULT_MIN_GROW_SIZE: usize = 256;
pub const DEFAULT_IO_COPY_BUFFER_SIZE: usize = 4 * 1024;

/// Construction options for [`ByteBuf`].
#[derive(Clone)]
pub struct BufOptions {
    /// Source of the backing store; reallocation on grow and `close` go
    /// through it.
    pub allocator: Arc<dyn Allocator>,
    /// Minimum step added per grow round.
    pub min_grow_size: usize,
    /// Chunk size for `read_from` / `write_to`.
    pub io_copy_buffer_size: usize,
    /// When false, grow preserves absolute indices instead of compacting
    /// the readable region to offset 0.
    pub compact_after_grow: bool,
}

impl Default for BufOptions {
    fn default() -> Self {
        BufOptions {
            allocator: default_allocator(),
            min_grow_size: DEFAULT_MIN_GROW_SIZE,
            io_copy_buffer_size: DEFAULT_IO_COPY_BUFFER_SIZE,
            compact_after_grow: true,
        }
    }
}

/// Reusable buffer over an allocator-owned `Vec<u8>` with separate read
/// and write positions.
///
/// ```text
/// | discardable bytes |  readable bytes  |  writable bytes  |
/// 0       <=     reader_index    <=    writer_index   <=  capacity
/// ```
///
/// A mark annotates `[reader_index, marked_index)` inside the readable
/// region; framing codecs use it to delimit one message's payload.
/// Index violations panic: they are usage errors, not runtime failures.
///
/// The buffer is not thread-safe; at most one task reads and one task
/// writes, and the session design gives each side exclusive ownership.
pub struct ByteBuf {
    buf: Vec<u8>,
    reader_index: usize,
    writer_index: usize,
    marked_index: usize,
    options: BufOptions,
}

macro_rules! impl_read_int {
    ($name:ident, $ty:ty, $size:expr) => {
        /// Reads a big-endian value, panics when fewer than the required
        /// bytes are readable.
        pub fn $name(&mut self) -> $ty {
            if self.readable() < $size {
                panic!(
                    concat!("read ", stringify!($ty), ", but readable is {}"),
                    self.readable()
                );
            }
            let start = self.reader_index;
            self.reader_index += $size;
            <$ty>::from_be_bytes(self.buf[start..start + $size].try_into().unwrap())
        }
    };
}

macro_rules! impl_write_int {
    ($name:ident, $ty:ty, $size:expr) => {
        /// Writes a big-endian value, growing first.
        pub fn $name(&mut self, value: $ty) {
            self.grow($size);
            self.buf[self.writer_index..self.writer_index + $size]
                .copy_from_slice(&value.to_be_bytes());
            self.writer_index += $size;
        }
    };
}

impl ByteBuf {
    pub fn new(capacity: usize) -> Self {
        Self::with_options(capacity, BufOptions::default())
    }

    pub fn with_options(capacity: usize, options: BufOptions) -> Self {
        let buf = options.allocator.alloc(capacity);
        ByteBuf {
            buf,
            reader_index: 0,
            writer_index: 0,
            marked_index: 0,
            options,
        }
    }

    /// Returns the backing store to the allocator. The buffer must not
    /// be used afterwards.
    pub fn close(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        self.options.allocator.free(buf);
        self.reader_index = 0;
        self.writer_index = 0;
        self.marked_index = 0;
    }

    /// Zeroes all indices so the buffer can be reused.
    pub fn reset(&mut self) {
        self.reader_index = 0;
        self.writer_index = 0;
        self.marked_index = 0;
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of bytes that can be read.
    pub fn readable(&self) -> usize {
        self.writer_index - self.reader_index
    }

    /// Number of bytes that can be written without growing.
    pub fn writable(&self) -> usize {
        self.capacity() - self.writer_index
    }

    pub fn read_index(&self) -> usize {
        self.reader_index
    }

    pub fn write_index(&self) -> usize {
        self.writer_index
    }

    pub fn mark_index(&self) -> usize {
        self.marked_index
    }

    pub fn set_read_index(&mut self, index: usize) {
        if index > self.writer_index {
            panic!(
                "invalid read index {index}, write index {}",
                self.writer_index
            );
        }
        self.reader_index = index;
    }

    pub fn set_write_index(&mut self, index: usize) {
        if index < self.reader_index || index > self.capacity() {
            panic!(
                "invalid write index {index}, capacity {}, read index {}",
                self.capacity(),
                self.reader_index
            );
        }
        self.writer_index = index;
    }

    /// Marks the readable sub-region `[reader_index, index)`. The region
    /// may not be empty and must lie inside the readable bytes.
    pub fn set_mark_index(&mut self, index: usize) {
        if index <= self.reader_index || index > self.writer_index {
            panic!(
                "invalid mark index {index}, read index {}, write index {}",
                self.reader_index, self.writer_index
            );
        }
        self.marked_index = index;
    }

    pub fn clear_mark(&mut self) {
        self.marked_index = 0;
    }

    /// Length of the marked region.
    pub fn marked_len(&self) -> usize {
        self.marked_index.saturating_sub(self.reader_index)
    }

    /// Discards `n` readable bytes.
    pub fn skip(&mut self, n: usize) {
        if n > self.readable() {
            panic!("invalid skip {n}, readable {}", self.readable());
        }
        self.reader_index += n;
    }

    /// Reads one byte, `None` when nothing is readable.
    pub fn read_byte(&mut self) -> Option<u8> {
        if self.readable() == 0 {
            return None;
        }
        let value = self.buf[self.reader_index];
        self.reader_index += 1;
        Some(value)
    }

    /// Copies up to `n` readable bytes into a fresh vector.
    pub fn read_bytes(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.readable());
        let data = self.buf[self.reader_index..self.reader_index + n].to_vec();
        self.reader_index += n;
        data
    }

    /// Copies the marked region, advances past it and clears the mark.
    pub fn read_marked(&mut self) -> Vec<u8> {
        let data = self.read_bytes(self.marked_len());
        self.clear_mark();
        data
    }

    /// Copies all readable bytes.
    pub fn read_all(&mut self) -> Vec<u8> {
        self.read_bytes(self.readable())
    }

    /// Non-consuming big-endian i32 at `offset` past the read index.
    pub fn peek_i32(&self, offset: usize) -> i32 {
        i32::from_be_bytes(self.peek_n(offset, 4).try_into().unwrap())
    }

    /// Non-consuming view of `n` bytes at `offset` past the read index.
    pub fn peek_n(&self, offset: usize, n: usize) -> &[u8] {
        if self.readable() < offset + n {
            panic!(
                "peek {n} bytes at offset {offset}, but readable is {}",
                self.readable()
            );
        }
        let start = self.reader_index + offset;
        &self.buf[start..start + n]
    }

    impl_read_int!(read_i32, i32, 4);
    impl_read_int!(read_u16, u16, 2);
    impl_read_int!(read_u32, u32, 4);
    impl_read_int!(read_i64, i64, 8);
    impl_read_int!(read_u64, u64, 8);

    /// Appends `src`, growing first.
    pub fn write(&mut self, src: &[u8]) {
        self.grow(src.len());
        self.buf[self.writer_index..self.writer_index + src.len()].copy_from_slice(src);
        self.writer_index += src.len();
    }

    pub fn write_byte(&mut self, value: u8) {
        self.grow(1);
        self.buf[self.writer_index] = value;
        self.writer_index += 1;
    }

    pub fn write_str(&mut self, value: &str) {
        self.write(value.as_bytes());
    }

    impl_write_int!(write_i32, i32, 4);
    impl_write_int!(write_u16, u16, 2);
    impl_write_int!(write_u32, u32, 4);
    impl_write_int!(write_i64, i64, 8);
    impl_write_int!(write_u64, u64, 8);

    /// Ensures at least `n` writable bytes. A reallocation rounds the new
    /// capacity up by `max(capacity / 2, min_grow_size)` steps and, unless
    /// disabled, compacts the readable region to offset 0.
    pub fn grow(&mut self, n: usize) {
        let free = self.writable();
        if free >= n {
            return;
        }

        let current = self.capacity();
        let step = (current / 2).max(self.options.min_grow_size);
        let size = current + (n - free);
        let mut target = current;
        while target <= size {
            target += step;
        }

        let mut new_buf = self.options.allocator.alloc(target);
        if self.options.compact_after_grow {
            let readable = self.readable();
            new_buf[..readable].copy_from_slice(&self.buf[self.reader_index..self.writer_index]);
            self.marked_index = self.marked_index.saturating_sub(self.reader_index);
            self.reader_index = 0;
            self.writer_index = readable;
        } else {
            new_buf[..self.writer_index].copy_from_slice(&self.buf[..self.writer_index]);
        }

        let old = std::mem::replace(&mut self.buf, new_buf);
        self.options.allocator.free(old);
    }

    /// Drains all readable bytes to `dst` in chunks bounded by the
    /// configured copy size. A zero-length write from the sink stops the
    /// drain. Returns the number of bytes written.
    pub async fn write_to<W>(&mut self, dst: &mut W) -> io::Result<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut written = 0;
        while self.readable() > 0 {
            let chunk = self.readable().min(self.options.io_copy_buffer_size);
            let n = dst
                .write(&self.buf[self.reader_index..self.reader_index + chunk])
                .await?;
            if n == 0 {
                break;
            }
            self.reader_index += n;
            written += n;
        }
        Ok(written)
    }

    /// Reads one chunk from `src` directly into writable space, growing
    /// first. Returns 0 on EOF.
    pub async fn read_from<R>(&mut self, src: &mut R) -> io::Result<usize>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.grow(self.options.io_copy_buffer_size);
        let start = self.writer_index;
        let end = start + self.options.io_copy_buffer_size;
        let n = src.read(&mut self.buf[start..end]).await?;
        self.writer_index += n;
        Ok(n)
    }
}

impl fmt::Debug for ByteBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteBuf")
            .field("capacity", &self.capacity())
            .field("reader_index", &self.reader_index)
            .field("writer_index", &self.writer_index)
            .field("marked_index", &self.marked_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncReadExt;

    use super::*;

    #[test]
    fn test_read_index() {
        let mut buf = ByteBuf::new(32);
        buf.set_write_index(6);
        buf.set_read_index(5);
        assert_eq!(5, buf.read_index());
    }

    #[test]
    fn test_write_index() {
        let mut buf = ByteBuf::new(32);
        buf.set_write_index(5);
        assert_eq!(5, buf.write_index());
    }

    #[test]
    fn test_mark_index() {
        let mut buf = ByteBuf::new(32);
        buf.set_write_index(6);
        buf.set_mark_index(5);
        assert_eq!(5, buf.mark_index());
        assert_eq!(5, buf.marked_len());
        buf.clear_mark();
        assert_eq!(0, buf.mark_index());
    }

    #[test]
    #[should_panic(expected = "invalid mark index")]
    fn test_mark_index_rejects_empty_region() {
        let mut buf = ByteBuf::new(32);
        buf.set_write_index(6);
        buf.set_read_index(5);
        buf.set_mark_index(5);
    }

    #[test]
    fn test_reset() {
        let mut buf = ByteBuf::new(32);
        buf.set_write_index(5);
        buf.set_read_index(2);
        buf.set_mark_index(4);
        buf.reset();
        assert_eq!(0, buf.read_index());
        assert_eq!(0, buf.write_index());
        assert_eq!(0, buf.mark_index());
    }

    #[test]
    fn test_skip() {
        let mut buf = ByteBuf::new(32);
        buf.set_write_index(5);
        buf.set_read_index(2);
        buf.skip(1);
        assert_eq!(3, buf.read_index());
    }

    #[test]
    #[should_panic(expected = "invalid skip")]
    fn test_skip_past_readable() {
        let mut buf = ByteBuf::new(32);
        buf.set_write_index(2);
        buf.skip(3);
    }

    #[test]
    fn test_read_byte() {
        let mut buf = ByteBuf::new(32);
        buf.write_str("hello");
        assert_eq!(Some(b'h'), buf.read_byte());
        assert_eq!(1, buf.read_index());
    }

    #[test]
    fn test_read_bytes() {
        let mut buf = ByteBuf::new(32);
        buf.write_str("hello");
        let data = buf.read_bytes(10);
        assert_eq!(b"hello", data.as_slice());
        assert_eq!(5, buf.read_index());
    }

    #[test]
    fn test_read_marked() {
        let mut buf = ByteBuf::new(32);
        buf.write_str("hello");
        buf.set_mark_index(buf.write_index());
        assert_eq!(b"hello", buf.read_marked().as_slice());
        assert_eq!(0, buf.mark_index());
        assert_eq!(5, buf.read_index());
    }

    #[test]
    fn test_read_all() {
        let mut buf = ByteBuf::new(32);
        buf.write_str("hello");
        assert_eq!(b"hello", buf.read_all().as_slice());
        assert_eq!(5, buf.read_index());
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut buf = ByteBuf::new(32);
        buf.write_i32(7);
        buf.write_str("xy");
        assert_eq!(7, buf.peek_i32(0));
        assert_eq!(b"xy", buf.peek_n(4, 2));
        assert_eq!(0, buf.read_index());
    }

    #[test]
    fn test_read_and_write_ints() {
        let mut buf = ByteBuf::new(32);
        buf.write_i32(1);
        buf.write_u16(2);
        buf.write_u32(3);
        buf.write_i64(4);
        buf.write_u64(5);
        assert_eq!(1, buf.read_i32());
        assert_eq!(2, buf.read_u16());
        assert_eq!(3, buf.read_u32());
        assert_eq!(4, buf.read_i64());
        assert_eq!(5, buf.read_u64());
        assert_eq!(buf.write_index(), buf.read_index());
    }

    #[test]
    #[should_panic(expected = "read i32")]
    fn test_read_i32_short() {
        let mut buf = ByteBuf::new(32);
        buf.write_u16(1);
        buf.read_i32();
    }

    #[test]
    fn test_write() {
        let mut buf = ByteBuf::new(32);
        buf.write(&[1, 2, 3, 4, 5]);
        assert_eq!(5, buf.write_index());
        assert_eq!(vec![1, 2, 3, 4, 5], buf.read_all());
    }

    #[test]
    fn test_write_byte() {
        let mut buf = ByteBuf::new(32);
        buf.write_byte(1);
        assert_eq!(1, buf.write_index());
        assert_eq!(vec![1], buf.read_all());
    }

    #[test]
    fn test_grow_compacts_readable_region() {
        let n = 1024 * 1024;
        let mut buf = ByteBuf::new(10);
        buf.set_write_index(5);
        buf.set_read_index(1);

        buf.write(&vec![0u8; n]);
        assert_eq!(0, buf.read_index());
        assert_eq!(n + 4, buf.write_index());
    }

    #[test]
    fn test_grow_with_compaction_disabled() {
        let n = 1024 * 1024;
        let mut buf = ByteBuf::with_options(
            10,
            BufOptions {
                compact_after_grow: false,
                ..BufOptions::default()
            },
        );
        buf.set_write_index(5);
        buf.set_read_index(1);

        buf.write(&vec![0u8; n]);
        assert_eq!(1, buf.read_index());
        assert_eq!(5 + n, buf.write_index());
    }

    #[tokio::test]
    async fn test_read_from() {
        let mut buf = ByteBuf::new(1);
        let data = [1u8, 2, 3, 4, 5];
        let n = buf.read_from(&mut &data[..]).await.unwrap();
        assert_eq!(5, n);
        assert_eq!(vec![1, 2, 3, 4, 5], buf.read_all());
    }

    #[tokio::test]
    async fn test_read_from_eof() {
        let mut buf = ByteBuf::new(1);
        let n = buf.read_from(&mut &[][..]).await.unwrap();
        assert_eq!(0, n);
    }

    #[tokio::test]
    async fn test_write_to() {
        let (mut remote, mut local) = tokio::io::duplex(64);
        let mut buf = ByteBuf::with_options(
            1,
            BufOptions {
                io_copy_buffer_size: 2,
                ..BufOptions::default()
            },
        );
        buf.write(&[1, 2, 3, 4, 5]);

        let n = buf.write_to(&mut local).await.unwrap();
        assert_eq!(5, n);
        assert_eq!(0, buf.readable());
        assert_eq!(buf.read_index(), buf.write_index());

        let mut received = [0u8; 5];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!([1, 2, 3, 4, 5], received);
    }
}
