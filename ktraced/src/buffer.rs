use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

pub const DEFAULT_BLOCK_SIZE: usize = 10 * 1024 * 1024; // 10 MiB
pub const DEFAULT_POOL_CEILING: usize = 300 * 1024 * 1024; // 300 MiB

/// One fixed-capacity byte block, tagged with the CPU whose pages it
/// holds. Appends are serialized by the block's own lock; the pool lock
/// never covers the byte copy.
#[derive(Debug)]
pub struct BufferBlock {
    pub cpu: u32,
    data: Vec<u8>,
    used: usize,
}

impl BufferBlock {
    fn new(cpu: u32, capacity: usize) -> Self {
        Self {
            cpu,
            data: vec![0u8; capacity],
            used: 0,
        }
    }

    pub fn free_bytes(&self) -> usize {
        self.data.len() - self.used
    }

    pub fn used_bytes(&self) -> usize {
        self.used
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Copy `src` into the free tail; `false` when the block is too full
    /// and the caller should ask the pool for a new one.
    pub fn append(&mut self, src: &[u8]) -> bool {
        if self.free_bytes() < src.len() {
            return false;
        }
        self.data[self.used..self.used + src.len()].copy_from_slice(src);
        self.used += src.len();
        true
    }
}

/// Shared handle: the producing reader thread and the consuming
/// assembler may hold one simultaneously.
pub type BlockHandle = Arc<Mutex<BufferBlock>>;

/// Process-wide pool of fixed-size blocks keyed by dump-task id, with a
/// global capacity ceiling. Releasing a task reclaims all of its blocks
/// in one step.
#[derive(Debug)]
pub struct TraceBufferManager {
    block_size: usize,
    ceiling: usize,
    inner: Mutex<PoolState>,
}

#[derive(Debug, Default)]
struct PoolState {
    total: usize,
    task_blocks: HashMap<u64, Vec<BlockHandle>>,
}

impl TraceBufferManager {
    pub fn new(ceiling: usize, block_size: usize) -> Self {
        Self {
            block_size,
            ceiling,
            inner: Mutex::new(PoolState::default()),
        }
    }

    /// Reserve one block for the task; `None` when the ceiling would be
    /// exceeded.
    pub fn allocate(&self, task_id: u64, cpu: u32) -> Option<BlockHandle> {
        let mut state = self.inner.lock().unwrap();
        if state.total + self.block_size > self.ceiling {
            return None;
        }
        let block = Arc::new(Mutex::new(BufferBlock::new(cpu, self.block_size)));
        state.task_blocks.entry(task_id).or_default().push(block.clone());
        state.total += self.block_size;
        Some(block)
    }

    /// Drop every block owned by the task, reclaiming their capacity.
    pub fn release(&self, task_id: u64) {
        let mut state = self.inner.lock().unwrap();
        if let Some(blocks) = state.task_blocks.remove(&task_id) {
            state.total -= blocks.len() * self.block_size;
        }
    }

    /// Snapshot view of a task's blocks in allocation order.
    pub fn blocks_of(&self, task_id: u64) -> Vec<BlockHandle> {
        let state = self.inner.lock().unwrap();
        state.task_blocks.get(&task_id).cloned().unwrap_or_default()
    }

    pub fn used_bytes(&self, task_id: u64) -> usize {
        let blocks = self.blocks_of(task_id);
        blocks.iter().map(|b| b.lock().unwrap().used_bytes()).sum()
    }

    /// Reserved capacity across all tasks.
    pub fn total_allocated(&self) -> usize {
        self.inner.lock().unwrap().total
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

static GLOBAL_POOL: Lazy<TraceBufferManager> =
    Lazy::new(|| TraceBufferManager::new(DEFAULT_POOL_CEILING, DEFAULT_BLOCK_SIZE));

/// The process-wide pool shared by all CPU readers.
pub fn pool() -> &'static TraceBufferManager {
    &GLOBAL_POOL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_respects_ceiling_and_release_reclaims() {
        let pool = TraceBufferManager::new(64, 32);
        let a = pool.allocate(1, 0).expect("first block");
        let _b = pool.allocate(1, 1).expect("second block");
        assert!(pool.allocate(1, 2).is_none(), "ceiling reached");
        assert_eq!(pool.total_allocated(), 64);

        a.lock().unwrap().append(&[1, 2, 3]);
        assert_eq!(pool.used_bytes(1), 3);

        pool.release(1);
        assert_eq!(pool.total_allocated(), 0);
        assert!(pool.blocks_of(1).is_empty());
        assert!(pool.allocate(2, 0).is_some());
    }

    #[test]
    fn append_refuses_overflow() {
        let pool = TraceBufferManager::new(32, 8);
        let block = pool.allocate(9, 0).unwrap();
        let mut block = block.lock().unwrap();
        assert!(block.append(&[0u8; 8]));
        assert_eq!(block.free_bytes(), 0);
        assert!(!block.append(&[0u8; 1]));
        assert_eq!(block.used_bytes(), 8);
        assert_eq!(block.payload().len(), 8);
    }

    #[test]
    fn tasks_are_isolated() {
        let pool = TraceBufferManager::new(1024, 16);
        pool.allocate(1, 0).unwrap();
        pool.allocate(2, 0).unwrap();
        pool.release(1);
        assert_eq!(pool.blocks_of(2).len(), 1);
        assert_eq!(pool.total_allocated(), 16);
    }

    #[test]
    fn blocks_are_shared_between_producer_and_consumer() {
        let pool = Arc::new(TraceBufferManager::new(1024, 64));
        let handle = pool.allocate(7, 3).unwrap();
        let producer = {
            let handle = handle.clone();
            std::thread::spawn(move || {
                handle.lock().unwrap().append(&[0xAB; 48]);
            })
        };
        producer.join().unwrap();
        let consumer_view = pool.blocks_of(7);
        assert_eq!(consumer_view.len(), 1);
        let block = consumer_view[0].lock().unwrap();
        assert_eq!(block.cpu, 3);
        assert_eq!(block.payload(), &[0xAB; 48][..]);
    }
}
