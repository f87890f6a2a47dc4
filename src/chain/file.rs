// JSON-lines chain record shared through the filesystem.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tracing::warn;

use super::{Block, ChainError, ChainLog};

const LOCK_RETRY: Duration = Duration::from_millis(10);
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(2);
const STALE_LOCK_AFTER: Duration = Duration::from_secs(30);

/// One block per line. Writers serialize through a sibling `.lock` file
/// created with `O_EXCL`, so several orchestrator processes may share the
/// record on one host or on a shared volume.
pub struct FileChainLog {
    path: PathBuf,
    lock_path: PathBuf,
    lock_wait: Duration,
}

struct LockGuard {
    path: PathBuf,
    token: String,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Only remove the lock if it is still ours.
        if fs::read_to_string(&self.path).is_ok_and(|t| t.trim() == self.token) {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl FileChainLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        Self {
            path,
            lock_path,
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<LockGuard, ChainError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let token = lock_token();
        let deadline = Instant::now() + self.lock_wait;
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
            {
                Ok(mut file) => {
                    writeln!(file, "{token}")?;
                    return Ok(LockGuard {
                        path: self.lock_path.clone(),
                        token,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&self.lock_path) && self.break_stale_lock(&token) {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(ChainError::Locked(self.lock_path.clone()));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Takes a stale lock out of the way.
    ///
    /// The lock is renamed rather than removed, so of several waiters that
    /// saw it stale only one moves it. Whoever moved a lock that turns out
    /// to be fresh (taken by a faster waiter meanwhile) links it back.
    fn break_stale_lock(&self, token: &str) -> bool {
        let moved = PathBuf::from(format!("{}.stale-{token}", self.lock_path.display()));
        if fs::rename(&self.lock_path, &moved).is_err() {
            return false;
        }

        if !is_stale(&moved) {
            let _ = fs::hard_link(&moved, &self.lock_path);
            let _ = fs::remove_file(&moved);
            return false;
        }

        let _ = fs::remove_file(&moved);
        warn!(
            component = "chain",
            event = "stale_lock_removed",
            path = %self.lock_path.display()
        );
        true
    }

    /// Cuts a line left unterminated by a writer that died mid-append.
    ///
    /// Only called under the lock, where no append can be in flight.
    fn truncate_torn_tail(&self) -> Result<(), ChainError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() || data.ends_with(b"\n") {
            return Ok(());
        }

        let keep = data
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(keep as u64)?;
        file.sync_data()?;
        warn!(
            component = "chain",
            event = "torn_tail_truncated",
            path = %self.path.display(),
            dropped_bytes = data.len() - keep
        );
        Ok(())
    }

    /// Blocks up to the first line that fails to decode, verify or follow
    /// its predecessor.
    fn valid_prefix(&self) -> Result<Vec<Block>, ChainError> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut blocks: Vec<Block> = Vec::new();
        for line in data.split(|&b| b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let Ok(block) = serde_json::from_slice::<Block>(line) else {
                break;
            };
            let expected = blocks.last().map(|b| b.height + 1).unwrap_or(1);
            if !block.verify() || block.height != expected {
                break;
            }
            blocks.push(block);
        }
        Ok(blocks)
    }

    /// Reads and validates every block.
    ///
    /// A final line without its newline is a write still in flight or one
    /// whose writer died. Readers skip it; `strict` callers reject it, and
    /// writers cut it under the lock before reading strictly.
    fn read_all(&self, strict: bool) -> Result<Vec<Block>, ChainError> {
        let data = match fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ChainError::Missing(self.path.clone()))
            }
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                return Err(ChainError::Corrupt {
                    line: 0,
                    reason: e.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };

        let mut lines: Vec<&str> = data.split('\n').collect();
        let tail = lines.pop().unwrap_or_default();
        if strict && !tail.is_empty() {
            return Err(ChainError::Corrupt {
                line: lines.len() + 1,
                reason: "unterminated last line".to_string(),
            });
        }

        let mut blocks: Vec<Block> = Vec::with_capacity(lines.len());
        for (i, line) in lines.into_iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let corrupt = |reason: String| ChainError::Corrupt { line: i + 1, reason };

            let block: Block = serde_json::from_str(line).map_err(|e| corrupt(e.to_string()))?;
            if !block.verify() {
                return Err(corrupt(format!("checksum mismatch at height {}", block.height)));
            }
            let expected = blocks.last().map(|b| b.height + 1).unwrap_or(1);
            if block.height != expected {
                return Err(corrupt(format!(
                    "height {} where {} was expected",
                    block.height, expected
                )));
            }
            blocks.push(block);
        }
        Ok(blocks)
    }

    fn move_aside(&self) -> Result<Option<PathBuf>, ChainError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let aside = PathBuf::from(format!(
            "{}.corrupt-{}",
            self.path.display(),
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f")
        ));
        fs::rename(&self.path, &aside)?;
        Ok(Some(aside))
    }
}

impl ChainLog for FileChainLog {
    fn head(&self) -> Result<u64, ChainError> {
        Ok(self.read_all(false)?.last().map(|b| b.height).unwrap_or(0))
    }

    fn append(&self, expected_head: u64, block: Block) -> Result<u64, ChainError> {
        let _guard = self.lock()?;
        self.truncate_torn_tail()?;

        let head = match self.read_all(true) {
            Ok(blocks) => blocks.last().map(|b| b.height).unwrap_or(0),
            Err(ChainError::Missing(_)) if expected_head == 0 => 0,
            Err(e) => return Err(e),
        };
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

        let mut line = serde_json::to_vec(&block)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.sync_data()?;
        Ok(block.height)
    }

    fn read_from(&self, from: u64) -> Result<Vec<Block>, ChainError> {
        let mut blocks = self.read_all(false)?;
        blocks.retain(|b| b.height >= from);
        Ok(blocks)
    }

    fn reset(&self, blocks: Vec<Block>) -> Result<(), ChainError> {
        let _guard = self.lock()?;
        self.truncate_torn_tail()?;

        // Another node may have repaired the record while we waited.
        if let Ok(existing) = self.read_all(true) {
            return Err(ChainError::Conflict {
                expected: 0,
                actual: existing.last().map(|b| b.height).unwrap_or(0),
            });
        }

        let mut kept = self.valid_prefix()?;
        let head = kept.last().map(|b| b.height).unwrap_or(0);
        kept.extend(blocks.into_iter().enumerate().map(|(i, b)| {
            if b.height == head + 1 + i as u64 {
                b
            } else {
                Block::new(head + 1 + i as u64, b.origin, b.intents)
            }
        }));

        if let Some(aside) = self.move_aside()? {
            warn!(
                component = "chain",
                event = "record_moved_aside",
                path = %self.path.display(),
                aside = %aside.display(),
                kept = head,
                "corrupt chain record replaced, valid prefix kept"
            );
        }

        let mut data = Vec::new();
        for block in &kept {
            data.extend(serde_json::to_vec(block)?);
            data.push(b'\n');
        }
        let tmp = PathBuf::from(format!("{}.tmp", self.path.display()));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn is_stale(lock: &Path) -> bool {
    fs::metadata(lock)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .map(|age| age > STALE_LOCK_AFTER)
        .unwrap_or(false)
}

fn lock_token() -> String {
    format!("{}-{}", std::process::id(), hex::encode(rand::random::<[u8; 6]>()))
}
