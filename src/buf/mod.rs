//! Reusable byte buffers and their allocators.
//!
//! [`ByteBuf`] is the backing store for both ends of a session: inbound
//! bytes are accumulated in it until a codec can decode a full message,
//! outbound messages are encoded into it and drained to the connection.

pub use allocator::{Allocator, HeapAllocator, PooledAllocator};
pub use byte_buf::{BufOptions, ByteBuf, DEFAULT_IO_COPY_BUFFER_SIZE, DEFAULT_MIN_GROW_SIZE};

pub(crate) use allocator::default_allocator;

mod allocator;
mod byte_buf;
