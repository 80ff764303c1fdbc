// Background piece-hash verification, run on its own task with its own
// priority queue so several torrents queued for a check don't block each
// other or starve the peer-session tasks.

use std::{
    cmp::Ordering,
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, oneshot};

/// How eagerly a torrent's verification should be scheduled against other
/// queued torrents. Distinct from `picker::Priority`, which gates individual
/// pieces within one torrent rather than whole torrents against each other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Capabilities the verifier needs from one torrent, supplied by the
/// controller. Kept narrow: the worker only ever reads bytes and reports
/// outcomes, it never touches peer or tracker state.
#[async_trait::async_trait]
pub trait Mediator: Send + Sync {
    fn info_hash(&self) -> [u8; 20];
    fn piece_count(&self) -> usize;
    fn total_size(&self) -> u64;

    /// Reads piece `idx` from storage, hashes it, and compares against the
    /// manifest.
    async fn check_piece(&self, idx: usize) -> bool;

    fn on_verify_queued(&self) {}
    fn on_verify_started(&self) {}
    fn on_piece_checked(&self, idx: usize, has_piece: bool);
    fn on_verify_done(&self, aborted: bool);
}

struct Node {
    mediator: Arc<dyn Mediator>,
    priority: Priority,
}

impl Node {
    fn info_hash(&self) -> [u8; 20] {
        self.mediator.info_hash()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.info_hash() == other.info_hash()
    }
}

impl Eq for Node {}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority torrents verify first...
        other.priority.cmp(&self.priority)
            // ...then smaller torrents, since they finish faster...
            .then_with(|| self.mediator.total_size().cmp(&other.mediator.total_size()))
            // ...then info-hash, purely for a total, deterministic order.
            .then_with(|| self.info_hash().cmp(&other.info_hash()))
    }
}

enum Command {
    Add(Node),
    Remove {
        info_hash: [u8; 20],
        done: oneshot::Sender<()>,
    },
}

/// Handle to the background verify task; cheap to clone, every clone talks
/// to the same queue.
#[derive(Debug, Clone)]
pub struct Worker {
    tx: mpsc::UnboundedSender<Command>,
}

impl Worker {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Queues a torrent for verification at `priority`. At most one torrent
    /// is actually being hashed at a time; the rest wait in priority order.
    pub fn add(&self, mediator: Arc<dyn Mediator>, priority: Priority) {
        mediator.on_verify_queued();
        let _ = self.tx.send(Command::Add(Node { mediator, priority }));
    }

    /// Cancels a queued or in-progress verification. Resolves once the
    /// mediator's `on_verify_done(true)` has fired (or would have, had it
    /// still been queued) for `info_hash`.
    pub async fn remove(&self, info_hash: [u8; 20]) {
        let (done, done_rx) = oneshot::channel();
        if self.tx.send(Command::Remove { info_hash, done }).is_ok() {
            let _ = done_rx.await;
        }
    }
}

fn remove_from_queue(todo: &mut BTreeSet<Node>, info_hash: [u8; 20]) -> Option<Node> {
    let mut found = None;
    let mut keep = BTreeSet::new();
    for node in std::mem::take(todo) {
        if found.is_none() && node.info_hash() == info_hash {
            found = Some(node);
        } else {
            keep.insert(node);
        }
    }
    *todo = keep;
    found
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut todo: BTreeSet<Node> = BTreeSet::new();

    loop {
        if todo.is_empty() {
            match rx.recv().await {
                Some(Command::Add(node)) => {
                    todo.insert(node);
                }
                Some(Command::Remove { done, .. }) => {
                    let _ = done.send(());
                }
                None => return,
            }
        }

        // Drain anything else already queued alongside it, so a batch of
        // torrents submitted together is ordered by priority/size rather
        // than by which happened to be received first.
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                Command::Add(node) => {
                    todo.insert(node);
                }
                Command::Remove { info_hash, done } => {
                    if let Some(node) = remove_from_queue(&mut todo, info_hash) {
                        node.mediator.on_verify_done(true);
                    }
                    let _ = done.send(());
                }
            }
        }

        let node = match todo.pop_first() {
            Some(node) => node,
            None => continue,
        };
        let waiters = verify_one(node.mediator, &mut rx, &mut todo).await;
        for done in waiters {
            let _ = done.send(());
        }
    }
}

/// Sleep this long for every second of wall-clock time spent hashing, to
/// keep verification from saturating disk I/O at the expense of active
/// downloads.
const SLEEP_PER_SECOND: Duration = Duration::from_millis(100);

async fn verify_one(
    mediator: Arc<dyn Mediator>,
    rx: &mut mpsc::UnboundedReceiver<Command>,
    todo: &mut BTreeSet<Node>,
) -> Vec<oneshot::Sender<()>> {
    let info_hash = mediator.info_hash();
    let mut aborted = false;
    let mut waiters = Vec::new();

    tracing::info!("verification started for {}", hex::encode(info_hash));
    mediator.on_verify_started();

    let num_pieces = mediator.piece_count();
    let mut last_slept_at = Instant::now();

    for piece in 0..num_pieces {
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                Command::Add(node) => {
                    todo.insert(node);
                }
                Command::Remove { info_hash: target, done } if target == info_hash => {
                    aborted = true;
                    waiters.push(done);
                }
                Command::Remove { info_hash: target, done } => {
                    if let Some(node) = remove_from_queue(todo, target) {
                        node.mediator.on_verify_done(true);
                    }
                    let _ = done.send(());
                }
            }
        }

        if aborted {
            break;
        }

        let valid = mediator.check_piece(piece).await;
        tracing::trace!("piece {} checked, valid: {}", piece, valid);
        mediator.on_piece_checked(piece, valid);

        if last_slept_at.elapsed() >= Duration::from_secs(1) {
            last_slept_at = Instant::now();
            tokio::time::sleep(SLEEP_PER_SECOND).await;
        }
    }

    if aborted {
        tracing::info!("verification aborted for {}", hex::encode(info_hash));
    } else {
        tracing::info!("verification finished for {}", hex::encode(info_hash));
    }
    mediator.on_verify_done(aborted);
    waiters
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Notify;

    // A mediator over in-memory "pieces": each is valid iff its bytes equal
    // `expected[idx]`. Good enough to exercise ordering and cancellation
    // without touching the filesystem.
    struct TestMediator {
        info_hash: [u8; 20],
        total_size: u64,
        pieces: Vec<bool>,
        checked: StdMutex<Vec<(usize, bool)>>,
        done: Notify,
        last_aborted: StdMutex<Option<bool>>,
    }

    impl TestMediator {
        fn new(info_hash: [u8; 20], total_size: u64, num_pieces: usize) -> Arc<Self> {
            Arc::new(Self {
                info_hash,
                total_size,
                pieces: vec![true; num_pieces],
                checked: StdMutex::new(Vec::new()),
                done: Notify::new(),
                last_aborted: StdMutex::new(None),
            })
        }
    }

    #[async_trait::async_trait]
    impl Mediator for TestMediator {
        fn info_hash(&self) -> [u8; 20] {
            self.info_hash
        }

        fn piece_count(&self) -> usize {
            self.pieces.len()
        }

        fn total_size(&self) -> u64 {
            self.total_size
        }

        async fn check_piece(&self, idx: usize) -> bool {
            self.pieces[idx]
        }

        fn on_piece_checked(&self, idx: usize, has_piece: bool) {
            self.checked.lock().unwrap().push((idx, has_piece));
        }

        fn on_verify_done(&self, aborted: bool) {
            *self.last_aborted.lock().unwrap() = Some(aborted);
            self.done.notify_one();
        }
    }

    fn hash(b: u8) -> [u8; 20] {
        let mut h = [0u8; 20];
        h[0] = b;
        h
    }

    #[tokio::test]
    async fn verifies_every_piece_in_order() {
        let worker = Worker::spawn();
        let mediator = TestMediator::new(hash(1), 100, 4);
        worker.add(mediator.clone(), Priority::Normal);
        mediator.done.notified().await;

        let checked = mediator.checked.lock().unwrap().clone();
        assert_eq!(checked, vec![(0, true), (1, true), (2, true), (3, true)]);
        assert_eq!(*mediator.last_aborted.lock().unwrap(), Some(false));
    }

    #[tokio::test]
    async fn higher_priority_torrent_is_verified_first() {
        let worker = Worker::spawn();

        // Queue a big low-priority torrent, then a small high-priority one;
        // expect the high-priority one to be reported done first.
        let order = Arc::new(StdMutex::new(Vec::new()));

        struct OrderTracking {
            inner: Arc<TestMediator>,
            order: Arc<StdMutex<Vec<[u8; 20]>>>,
        }
        #[async_trait::async_trait]
        impl Mediator for OrderTracking {
            fn info_hash(&self) -> [u8; 20] {
                self.inner.info_hash()
            }
            fn piece_count(&self) -> usize {
                self.inner.piece_count()
            }
            fn total_size(&self) -> u64 {
                self.inner.total_size()
            }
            async fn check_piece(&self, idx: usize) -> bool {
                self.inner.check_piece(idx).await
            }
            fn on_piece_checked(&self, idx: usize, has_piece: bool) {
                self.inner.on_piece_checked(idx, has_piece);
            }
            fn on_verify_done(&self, aborted: bool) {
                self.order.lock().unwrap().push(self.inner.info_hash());
                self.inner.on_verify_done(aborted);
            }
        }

        let low = Arc::new(OrderTracking {
            inner: Arc::new(TestMediator {
                info_hash: hash(1),
                total_size: 1_000_000,
                pieces: vec![true; 1],
                checked: StdMutex::new(Vec::new()),
                done: Notify::new(),
                last_aborted: StdMutex::new(None),
            }),
            order: order.clone(),
        });
        let high = Arc::new(OrderTracking {
            inner: Arc::new(TestMediator {
                info_hash: hash(2),
                total_size: 10,
                pieces: vec![true; 1],
                checked: StdMutex::new(Vec::new()),
                done: Notify::new(),
                last_aborted: StdMutex::new(None),
            }),
            order: order.clone(),
        });

        // Added in a single batch before the worker has a chance to start,
        // so both are in `todo` together and ordering is decided purely by
        // priority/size, not arrival time.
        worker.add(low.clone(), Priority::Low);
        worker.add(high.clone(), Priority::High);

        low.inner.done.notified().await;
        high.inner.done.notified().await;

        assert_eq!(*order.lock().unwrap(), vec![hash(2), hash(1)]);
    }

    #[tokio::test]
    async fn remove_cancels_a_queued_torrent_without_running_it() {
        let worker = Worker::spawn();

        // Block the worker on a slow torrent first so the second one is
        // still sitting in `todo` when we remove it.
        let blocker = TestMediator::new(hash(9), 1, 200);
        worker.add(blocker.clone(), Priority::Normal);

        let queued = TestMediator::new(hash(3), 1, 1);
        worker.add(queued.clone(), Priority::Normal);

        worker.remove(hash(3)).await;
        blocker.done.notified().await;

        assert!(queued.checked.lock().unwrap().is_empty());
        assert_eq!(*queued.last_aborted.lock().unwrap(), Some(true));
    }
}
