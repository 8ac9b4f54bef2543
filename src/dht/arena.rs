use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;
use std::sync::Arc;

/// Fixed free-list of receive buffers.
///
/// The UDP reader pops a buffer per packet and the engine pushes it back
/// once the packet is handled, so the hot receive path reuses a bounded
/// working set instead of allocating per datagram. An empty pool falls
/// back to a fresh allocation; the bounded inbound queue keeps that
/// transient.
pub(crate) struct Arena {
    blocks: ArrayQueue<BytesMut>,
    block_size: usize,
}

impl Arena {
    pub fn new(block_size: usize, num_blocks: usize) -> Arc<Self> {
        let arena = Arc::new(Self {
            blocks: ArrayQueue::new(num_blocks),
            block_size,
        });
        for _ in 0..num_blocks {
            let _ = arena.blocks.push(BytesMut::with_capacity(block_size));
        }
        arena
    }

    pub fn acquire(&self) -> BytesMut {
        self.blocks
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.block_size))
    }

    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        let _ = self.blocks.push(buf);
    }

    #[cfg(test)]
    pub fn available(&self) -> usize {
        self.blocks.len()
    }
}
