use std::sync::Arc;

use parking_lot::Mutex;

/// Memory source for [`ByteBuf`](super::ByteBuf) backing stores.
///
/// `alloc` returns a buffer with `len() == size`. Buffers must be handed
/// back through `free` on the allocator that produced them.
pub trait Allocator: Send + Sync {
    fn alloc(&self, size: usize) -> Vec<u8>;
    fn free(&self, buf: Vec<u8>);
}

/// Non-reusable allocator: every `alloc` hits the heap, `free` drops.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn alloc(&self, size: usize) -> Vec<u8> {
        vec![0; size]
    }

    fn free(&self, _buf: Vec<u8>) {}
}

pub(crate) fn default_allocator() -> Arc<dyn Allocator> {
    Arc::new(HeapAllocator)
}

/// Size-class pooling allocator.
///
/// Classes grow geometrically from `min_size` by `factor` and are capped
/// at `max_size`. Requests above the largest class fall through to the
/// heap and are dropped on `free`.
pub struct PooledAllocator {
    classes: Vec<usize>,
    pools: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl PooledAllocator {
    pub fn new(min_size: usize, max_size: usize, factor: usize) -> Self {
        assert!(
            min_size > 0 && factor > 1 && max_size >= min_size,
            "invalid pool sizing: min {min_size}, max {max_size}, factor {factor}"
        );

        let mut classes = Vec::new();
        let mut size = min_size;
        while size < max_size {
            classes.push(size);
            size *= factor;
        }
        classes.push(max_size);

        let pools = classes.iter().map(|_| Mutex::new(Vec::new())).collect();
        PooledAllocator { classes, pools }
    }
}

impl Allocator for PooledAllocator {
    fn alloc(&self, size: usize) -> Vec<u8> {
        match self.classes.iter().position(|&class| size <= class) {
            Some(idx) => {
                let mut buf = self.pools[idx]
                    .lock()
                    .pop()
                    .unwrap_or_else(|| Vec::with_capacity(self.classes[idx]));
                buf.resize(size, 0);
                buf
            }
            None => vec![0; size],
        }
    }

    fn free(&self, mut buf: Vec<u8>) {
        if let Some(idx) = self.classes.iter().position(|&class| class == buf.capacity()) {
            buf.clear();
            self.pools[idx].lock().push(buf);
        }
    }
}
