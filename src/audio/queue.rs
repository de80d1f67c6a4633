use super::AudioBlock;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Bounded hand-off between the capture callback and the sender loop.
///
/// When full, pushing evicts the oldest pending block so the capture
/// callback never waits. The two ends are not `Clone`, which keeps the
/// queue single-producer/single-consumer.
///
/// Sample buffers travel back from the consumer through a second queue, so
/// the capture callback can refill them instead of allocating per block.
pub struct OutboundQueue {
    shared: Arc<Shared>,
}

struct Shared {
    blocks: ArrayQueue<AudioBlock>,
    spare: ArrayQueue<Vec<i16>>,
    closed: AtomicBool,
    dropped: AtomicU64,
    pushed: AtomicU64,
}

impl OutboundQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                blocks: ArrayQueue::new(capacity.max(1)),
                spare: ArrayQueue::new(capacity.max(1)),
                closed: AtomicBool::new(false),
                dropped: AtomicU64::new(0),
                pushed: AtomicU64::new(0),
            }),
        }
    }

    pub fn split(self) -> (BlockProducer, BlockConsumer) {
        (
            BlockProducer {
                shared: Arc::clone(&self.shared),
            },
            BlockConsumer {
                shared: self.shared,
            },
        )
    }
}

pub struct BlockProducer {
    shared: Arc<Shared>,
}

impl BlockProducer {
    /// Enqueue without blocking. Returns `false` once the queue is closed.
    pub fn push(&self, block: AudioBlock) -> bool {
        if self.shared.closed.load(Ordering::Acquire) {
            return false;
        }
        if self.shared.blocks.force_push(block).is_some() {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.shared.pushed.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// An emptied buffer handed back by the consumer, if one is waiting.
    pub fn recycled(&self) -> Option<Vec<i16>> {
        self.shared.spare.pop()
    }
}

pub struct BlockConsumer {
    shared: Arc<Shared>,
}

impl BlockConsumer {
    /// Oldest pending block, if any.
    pub fn pop(&self) -> Option<AudioBlock> {
        self.shared.blocks.pop()
    }

    /// Return a sent block's buffer for reuse by the producer.
    pub fn recycle(&self, block: AudioBlock) {
        let mut samples = block.into_samples();
        samples.clear();
        let _ = self.shared.spare.push(samples);
    }

    /// Stop accepting new blocks and discard whatever is pending.
    pub fn close(&self) -> usize {
        self.shared.closed.store(true, Ordering::Release);
        let mut discarded = 0;
        while self.shared.blocks.pop().is_some() {
            discarded += 1;
        }
        discarded
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.blocks.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.blocks.capacity()
    }

    /// Blocks evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    pub fn pushed(&self) -> u64 {
        self.shared.pushed.load(Ordering::Relaxed)
    }
}
