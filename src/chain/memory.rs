// In-process chain record.

use parking_lot::Mutex;

use super::{Block, ChainError, ChainLog};

/// Chain record held in memory. Nodes sharing one `Arc<MemoryChainLog>`
/// behave like nodes sharing a file.
#[derive(Default)]
pub struct MemoryChainLog {
    blocks: Mutex<Vec<Block>>,
}

impl MemoryChainLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChainLog for MemoryChainLog {
    fn head(&self) -> Result<u64, ChainError> {
        Ok(self.blocks.lock().last().map(|b| b.height).unwrap_or(0))
    }

    fn append(&self, expected_head: u64, block: Block) -> Result<u64, ChainError> {
        let mut blocks = self.blocks.lock();
        let head = blocks.last().map(|b| b.height).unwrap_or(0);
        if head != expected_head {
            return Err(ChainError::Conflict {
                expected: expected_head,
                actual: head,
            });
        }
        if block.height != head + 1 {
            return Err(ChainError::InvalidHeight {
                head,
                got: block.height,
            });
        }
        blocks.push(block);
        Ok(head + 1)
    }

    fn read_from(&self, from: u64) -> Result<Vec<Block>, ChainError> {
        Ok(self
            .blocks
            .lock()
            .iter()
            .filter(|b| b.height >= from)
            .cloned()
            .collect())
    }

    /// An in-memory record never goes unreadable, so there is nothing to
    /// repair.
    fn reset(&self, _blocks: Vec<Block>) -> Result<(), ChainError> {
        Err(ChainError::Conflict {
            expected: 0,
            actual: self.head()?,
        })
    }
}
