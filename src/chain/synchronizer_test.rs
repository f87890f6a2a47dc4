use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{
    Block, ChainError, ChainLog, ChainSynchronizer, Desired, FileChainLog, Intent, LocalService,
    MemoryChainLog, Reconciler,
};
use crate::config::ChainSettings;

#[derive(Default)]
struct FakeNode {
    local: Mutex<BTreeMap<String, LocalService>>,
    pending: Mutex<Vec<Intent>>,
    resurrected: Mutex<Vec<String>>,
    deactivated: Mutex<Vec<String>>,
}

impl FakeNode {
    fn running(&self, service: &str) {
        self.local.lock().insert(
            service.to_string(),
            LocalService {
                up: 1,
                live: 1,
                failed: false,
            },
        );
    }

    fn failed(&self, service: &str) {
        self.local.lock().insert(
            service.to_string(),
            LocalService {
                up: 0,
                live: 0,
                failed: true,
            },
        );
    }

    fn intend(&self, intent: Intent) {
        self.pending.lock().push(intent);
    }
}

#[async_trait]
impl Reconciler for FakeNode {
    fn local_view(&self) -> BTreeMap<String, LocalService> {
        self.local.lock().clone()
    }

    async fn resurrect(&self, service: &str) -> anyhow::Result<()> {
        self.resurrected.lock().push(service.to_string());
        self.running(service);
        Ok(())
    }

    async fn deactivate(&self, service: &str) -> anyhow::Result<()> {
        self.deactivated.lock().push(service.to_string());
        self.local.lock().remove(service);
        Ok(())
    }

    fn take_pending_intents(&self) -> Vec<Intent> {
        std::mem::take(&mut *self.pending.lock())
    }

    fn restore_pending_intents(&self, mut intents: Vec<Intent>) {
        let mut pending = self.pending.lock();
        intents.append(&mut pending);
        *pending = intents;
    }
}

fn settings(node: &str) -> ChainSettings {
    ChainSettings {
        enabled: true,
        path: PathBuf::from("unused"),
        node_id: node.to_string(),
        tick: Duration::from_millis(50),
        max_append_retries: 3,
    }
}

fn node(name: &str, log: Arc<dyn ChainLog>) -> (Arc<FakeNode>, ChainSynchronizer) {
    let fake = Arc::new(FakeNode::default());
    let sync = ChainSynchronizer::new(settings(name), log, fake.clone());
    (fake, sync)
}

#[tokio::test]
async fn test_pending_intents_append_once_then_converge() {
    let log = Arc::new(MemoryChainLog::new());
    let (a, sync) = node("a", log.clone());

    a.running("api");
    a.intend(Intent::active("api"));
    let first = sync.tick().await.unwrap();
    assert_eq!(first.appended, Some(1));
    assert_eq!(first.height, 1);

    let second = sync.tick().await.unwrap();
    assert_eq!(second.appended, None);
    assert!(second.resurrected.is_empty());
    assert_eq!(log.head().unwrap(), 1);

    // Re-declaring what the mesh already says appends nothing.
    a.intend(Intent::active("api"));
    assert_eq!(sync.tick().await.unwrap().appended, None);
    assert_eq!(sync.view().get("api"), Some((Desired::Active, 1)));
}

#[tokio::test]
async fn test_peer_resurrects_active_service_once() {
    let log: Arc<dyn ChainLog> = Arc::new(MemoryChainLog::new());
    let (a, sync_a) = node("a", log.clone());
    let (b, sync_b) = node("b", log.clone());

    a.running("api");
    a.intend(Intent::active("api"));
    sync_a.tick().await.unwrap();

    let report = sync_b.tick().await.unwrap();
    assert_eq!(report.resurrected, vec!["api".to_string()]);
    assert_eq!(report.appended, None);

    // Already running now: nothing more to do.
    let again = sync_b.tick().await.unwrap();
    assert!(again.resurrected.is_empty());
    assert_eq!(b.resurrected.lock().len(), 1);
}

#[tokio::test]
async fn test_newer_inactive_intent_terminates_local_instances() {
    let log: Arc<dyn ChainLog> = Arc::new(MemoryChainLog::new());
    let (a, sync_a) = node("a", log.clone());
    let (b, sync_b) = node("b", log.clone());

    a.intend(Intent::active("api"));
    a.running("api");
    sync_a.tick().await.unwrap();
    sync_b.tick().await.unwrap();
    assert!(b.local_view().contains_key("api"));

    a.intend(Intent::inactive("api"));
    sync_a.tick().await.unwrap();

    let report = sync_b.tick().await.unwrap();
    assert_eq!(report.deactivated, vec!["api".to_string()]);
    assert!(!b.local_view().contains_key("api"));

    // An old inactive intent does not fire again.
    b.running("api");
    let later = sync_b.tick().await.unwrap();
    assert!(later.deactivated.is_empty());
}

#[tokio::test]
async fn test_pending_local_intent_wins_over_chain() {
    let log: Arc<dyn ChainLog> = Arc::new(MemoryChainLog::new());
    let (a, sync_a) = node("a", log.clone());
    let (b, sync_b) = node("b", log.clone());

    a.intend(Intent::inactive("api"));
    sync_a.tick().await.unwrap();

    b.running("api");
    b.intend(Intent::active("api"));
    let report = sync_b.tick().await.unwrap();
    assert!(report.deactivated.is_empty());
    assert_eq!(report.appended, Some(2));
    assert_eq!(sync_b.view().get("api"), Some((Desired::Active, 2)));

    // The other node now resurrects it.
    let report_a = sync_a.tick().await.unwrap();
    assert_eq!(report_a.resurrected, vec!["api".to_string()]);
}

#[tokio::test]
async fn test_failed_services_are_not_resurrected() {
    let log: Arc<dyn ChainLog> = Arc::new(MemoryChainLog::new());
    log.append(0, Block::new(1, "peer", vec![Intent::active("api")]))
        .unwrap();

    let (b, sync_b) = node("b", log);
    b.failed("api");
    let report = sync_b.tick().await.unwrap();
    assert!(report.resurrected.is_empty());
}

#[tokio::test]
async fn test_missing_record_is_reinitialized_from_local_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.jsonl");
    let (a, sync) = node("a", Arc::new(FileChainLog::new(&path)));
    a.running("db");

    let report = sync.tick().await.unwrap();
    assert!(report.reset);
    assert_eq!(report.height, 1);
    assert_eq!(sync.view().get("db"), Some((Desired::Active, 1)));

    let on_disk = FileChainLog::new(&path).read_from(1).unwrap();
    assert_eq!(on_disk.len(), 1);
    assert_eq!(on_disk[0].origin, "a");
}

/// Lets a foreign writer win the first `races` appends.
struct RacingLog {
    inner: MemoryChainLog,
    races: AtomicUsize,
}

impl ChainLog for RacingLog {
    fn head(&self) -> Result<u64, ChainError> {
        self.inner.head()
    }

    fn append(&self, expected_head: u64, block: Block) -> Result<u64, ChainError> {
        if self.races.load(Ordering::SeqCst) > 0 {
            self.races.fetch_sub(1, Ordering::SeqCst);
            let head = self.inner.head()?;
            self.inner
                .append(head, Block::new(head + 1, "rival", vec![Intent::active("rival")]))?;
        }
        self.inner.append(expected_head, block)
    }

    fn read_from(&self, from: u64) -> Result<Vec<Block>, ChainError> {
        self.inner.read_from(from)
    }

    fn reset(&self, blocks: Vec<Block>) -> Result<(), ChainError> {
        self.inner.reset(blocks)
    }
}

#[tokio::test]
async fn test_conflict_is_retried_after_reread() {
    let log = Arc::new(RacingLog {
        inner: MemoryChainLog::new(),
        races: AtomicUsize::new(1),
    });
    let (a, sync) = node("a", log.clone());
    a.running("rival");
    a.intend(Intent::active("api"));

    let report = sync.tick().await.unwrap();
    assert_eq!(report.appended, Some(2));

    let blocks = log.read_from(1).unwrap();
    assert_eq!(blocks[0].origin, "rival");
    assert_eq!(blocks[1].origin, "a");
}

#[tokio::test]
async fn test_pending_intents_survive_lost_races() {
    let log = Arc::new(RacingLog {
        inner: MemoryChainLog::new(),
        races: AtomicUsize::new(100),
    });
    let (a, sync) = node("a", log);
    a.running("rival");
    a.intend(Intent::active("api"));

    let report = sync.tick().await.unwrap();
    assert_eq!(report.appended, None);
    assert_eq!(a.pending.lock().clone(), vec![Intent::active("api")]);
}

#[tokio::test]
async fn test_tick_appends_after_writer_died_mid_line() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.jsonl");
    let log = Arc::new(FileChainLog::new(&path));
    log.append(0, Block::new(1, "b", vec![Intent::active("api")]))
        .unwrap();
    {
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"height\":2,\"ori").unwrap();
    }

    let (a, sync) = node("a", log.clone());
    a.running("api");
    a.intend(Intent::inactive("api"));

    let report = sync.tick().await.unwrap();
    assert_eq!(report.appended, Some(2));
    assert_eq!(sync.view().get("api"), Some((Desired::Inactive, 2)));
    assert_eq!(log.head().unwrap(), 2);
    assert!(a.pending.lock().is_empty());
}
