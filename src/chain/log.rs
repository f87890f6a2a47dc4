// Storage seam for the chain record.

use std::path::PathBuf;

use super::Block;

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain head moved: expected {expected}, found {actual}")]
    Conflict { expected: u64, actual: u64 },
    #[error("chain record {0:?} does not exist")]
    Missing(PathBuf),
    #[error("chain record corrupt at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
    #[error("chain record is locked by another writer: {0:?}")]
    Locked(PathBuf),
    #[error("block height {got} does not follow head {head}")]
    InvalidHeight { head: u64, got: u64 },
    #[error("chain io: {0}")]
    Io(#[from] std::io::Error),
    #[error("chain encoding: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ChainError {
    /// Errors that are cured by re-initializing the record.
    pub fn needs_reset(&self) -> bool {
        matches!(self, ChainError::Missing(_) | ChainError::Corrupt { .. })
    }
}

/// Append-only, height-ordered block store shared by every node.
///
/// `append` is compare-and-increment: it succeeds only when the stored head
/// still equals `expected_head` and the block sits at `expected_head + 1`.
pub trait ChainLog: Send + Sync {
    /// Height of the last block, 0 for an empty record.
    fn head(&self) -> Result<u64, ChainError>;

    /// Appends `block`, returning the new head.
    fn append(&self, expected_head: u64, block: Block) -> Result<u64, ChainError>;

    /// Blocks with `height >= from`, in order.
    fn read_from(&self, from: u64) -> Result<Vec<Block>, ChainError>;

    /// Repairs an unusable record: blocks that still read back in order are
    /// kept, `blocks` follow them, renumbered to continue the height.
    ///
    /// Fails with `Conflict` when the record turns out to be readable by the
    /// time the writer holds it, so concurrent repairs do not clobber each other.
    fn reset(&self, blocks: Vec<Block>) -> Result<(), ChainError>;
}
