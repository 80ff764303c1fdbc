//! Owns every torrent in the process, the control surface embedders talk
//! to, and the ambient session-wide resources a lone `Torrent` has no
//! business owning itself: bandwidth limiters, the download/seed queue,
//! and resume/queue.json persistence. Grounded on `client.rs` (teacher
//! leftover, not wired into `lib.rs`): same `HashMap<ID, TorrentHandle>` +
//! command-channel shape, generalized from a single `ClientCommand` enum
//! to a direct async API, since `Torrent` already exposes an actor-style
//! command channel for everything a `Session` needs to drive remotely.

use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::{mpsc, oneshot}, task::JoinHandle};
use crate::{
    config::{SessionConfig, TorrentConfig},
    error::ErrorKind,
    metainfo::MetaInfo,
    picker::Priority,
    resume::{Queue, ResumeError, ResumeFile, WantedState},
    stats::TorrentStats,
    torrent::{self, CommandToTorrent, Torrent, TorrentTx},
    ID,
};

pub type TorrentId = ID;
pub type SessionEventTx = mpsc::UnboundedSender<SessionEvent>;
pub type SessionEventRx = mpsc::UnboundedReceiver<SessionEvent>;

/// Lifecycle/progress notifications a `Session` hands embedders (UIs, RPC
/// layers) so they never have to poll a torrent directly.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Added(TorrentId),
    Started(TorrentId),
    Stopped(TorrentId),
    Verified(TorrentId, Range<usize>),
    PieceComplete(TorrentId, usize),
    Completed(TorrentId),
    Error(TorrentId, String),
    StatsTick(TorrentId, Arc<TorrentStats>),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {

    #[error("unknown torrent {0}")]
    UnknownTorrent(String),

    #[error("torrent error: {0}")]
    TorrentError(#[from] torrent::TorrentError),

    #[error("resume error: {0}")]
    ResumeError(#[from] ResumeError),

    #[error("metainfo error: {0}")]
    MetaInfoError(#[from] crate::metainfo::MetaInfoError),

    #[error("channel error: torrent task gone")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// The state a newly-added torrent begins in, per the `add(manifest,
/// save_path, initial_state)` control-surface operation: either it starts
/// its `Checking`/announce cycle immediately, or it sits `Stopped` until an
/// explicit `start` call (the "add paused" case).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialState {
    Starting,
    Stopped,
}

/// A torrent not yet (or no longer) driven by its own task, vs. one with a
/// live `run` loop reachable only through `CommandToTorrent`. `start`
/// transitions `Idle` to `Running`; nothing transitions the other way —
/// a stopped-but-running torrent just sits idling in its own `select!`
/// loop rather than being torn down and rebuilt.
enum TorrentSlot {
    Idle(Torrent),
    Running { command_tx: TorrentTx, join: JoinHandle<torrent::Result<()>> },
    // Placeholder occupied only for the instant `start` is swapping the two.
    Transitioning,
}

struct TorrentHandle {
    slot: TorrentSlot,
    save_path: PathBuf,
    added_date: i64,
}

/// Owns every torrent in the process. Each running torrent drives its own
/// `tokio::select!` loop (`Torrent::run`); the session never touches
/// per-torrent state directly, only through `CommandToTorrent`, or directly
/// on an `Idle` torrent it still solely owns.
pub struct Session {

    config: SessionConfig,

    torrents: HashMap<TorrentId, TorrentHandle>,

    queue: Queue,

    event_tx: SessionEventTx,

    down_limiter: Option<Arc<leaky_bucket::RateLimiter>>,

    up_limiter: Option<Arc<leaky_bucket::RateLimiter>>,

    client_id: [u8; 20],

    // Directory `<info-hash>.resume` files and `queue.json` live in.
    state_dir: PathBuf,

    next_port: u16,
}

const DEFAULT_CLIENT_ID: [u8; 20] = *b"-RS0133-73b3b0b0b0b0";

impl Session {

    /// Builds a session and returns the event receiver the embedder drains.
    /// `state_dir` is where resume files and `queue.json` are read/written;
    /// an existing `queue.json` is loaded immediately so queue positions
    /// survive a restart even before any torrent is re-added.
    pub fn new(config: SessionConfig, state_dir: PathBuf) -> (Self, SessionEventRx) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let queue = Queue::load(&state_dir).unwrap_or_default();

        let down_limiter = config.speed_limit_down.map(Self::build_limiter);
        let up_limiter = config.speed_limit_up.map(Self::build_limiter);

        let next_port = if config.peer_port_random {
            use rand::Rng;
            rand::thread_rng().gen_range(1024..=65535)
        } else {
            config.peer_port
        };

        (
            Session {
                config,
                torrents: HashMap::new(),
                queue,
                event_tx,
                down_limiter,
                up_limiter,
                client_id: DEFAULT_CLIENT_ID,
                state_dir,
                next_port,
            },
            event_rx,
        )
    }

    fn build_limiter(bytes_per_sec: u64) -> Arc<leaky_bucket::RateLimiter> {
        Arc::new(
            leaky_bucket::RateLimiter::builder()
                .max(bytes_per_sec.max(1) as usize)
                .initial(bytes_per_sec.max(1) as usize)
                .refill(bytes_per_sec.max(1) as usize)
                .interval(Duration::from_secs(1))
                .build(),
        )
    }

    fn torrent_config(&mut self, output_dir: PathBuf) -> TorrentConfig {
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1);
        TorrentConfig {
            client_id: self.client_id,
            output_dir,
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port),
            announce_interval: Duration::from_secs(1800),
            min_max_peers: (5, self.config.peer_limit_per_torrent),
            encryption_mode: self.config.encryption_mode,
        }
    }

    fn spawn_running(info_hash: TorrentId, torrent: Torrent, event_tx: SessionEventTx) -> TorrentSlot {
        let mut torrent = torrent;
        let command_tx = torrent.command_tx();
        let join = tokio::spawn(async move {
            let result = torrent.start().await;
            if let Err(e) = &result {
                let _ = event_tx.send(SessionEvent::Error(info_hash, classify(e).to_string()));
            }
            result
        });
        TorrentSlot::Running { command_tx, join }
    }

    /// Parses a `.torrent` file and adds it; convenience over `add` for
    /// callers (the `cli` crate) that only have a path.
    pub async fn add_from_path(&mut self, path: impl AsRef<Path>, save_path: Option<PathBuf>, initial_state: InitialState) -> Result<TorrentId> {
        let metainfo = MetaInfo::new(path)?;
        self.add(metainfo, save_path, initial_state).await
    }

    /// Registers a torrent. If a resume file for this info-hash exists in
    /// `state_dir` its queue position and per-file wanted-state are
    /// restored; the have-bitfield is not trusted and a full `Checking`
    /// pass runs regardless, once started.
    pub async fn add(&mut self, metainfo: MetaInfo, save_path: Option<PathBuf>, initial_state: InitialState) -> Result<TorrentId> {
        let info_hash = metainfo.info_hash();
        let output_dir = save_path.unwrap_or_else(|| self.config.active_dir().to_path_buf());

        let resume = ResumeFile::load(&self.state_dir, &info_hash).ok();
        let added_date = resume.as_ref().map(|r| r.added_date).unwrap_or_else(unix_now);
        let queue_pos = resume.as_ref().map(|r| r.queue_position);

        let config = self.torrent_config(output_dir.clone());
        let mut torrent = Torrent::with_context(
            metainfo,
            config,
            self.down_limiter.clone(),
            self.up_limiter.clone(),
            Some(self.event_tx.clone()),
        ).await;

        if let Some(rf) = &resume {
            let wanted: Vec<usize> = rf.file_wanted.iter()
                .enumerate()
                .filter(|(_, w)| **w == WantedState::Skipped)
                .map(|(i, _)| i)
                .collect();
            if !wanted.is_empty() {
                let _ = torrent.set_wanted(&wanted, false).await;
            }
        }

        let slot = match initial_state {
            InitialState::Starting => Self::spawn_running(info_hash, torrent, self.event_tx.clone()),
            InitialState::Stopped => TorrentSlot::Idle(torrent),
        };

        self.torrents.insert(info_hash, TorrentHandle { slot, save_path: output_dir, added_date });

        self.queue.add(info_hash);
        if let Some(pos) = queue_pos {
            self.queue.set_pos(&info_hash, pos);
        }

        let _ = self.event_tx.send(SessionEvent::Added(info_hash));
        Ok(info_hash)
    }

    fn handle_mut(&mut self, id: &TorrentId) -> Result<&mut TorrentHandle> {
        self.torrents.get_mut(id).ok_or_else(|| SessionError::UnknownTorrent(hex::encode(id)))
    }

    /// Starts an `Idle` torrent's event loop; a no-op on one already running.
    pub async fn start(&mut self, id: &TorrentId) -> Result<()> {
        let event_tx = self.event_tx.clone();
        let info_hash = *id;
        let handle = self.handle_mut(id)?;
        let torrent = match std::mem::replace(&mut handle.slot, TorrentSlot::Transitioning) {
            TorrentSlot::Idle(t) => t,
            other => {
                handle.slot = other;
                return Ok(());
            }
        };
        handle.slot = Self::spawn_running(info_hash, torrent, event_tx);
        Ok(())
    }

    pub async fn stop(&mut self, id: &TorrentId) -> Result<()> {
        let handle = self.handle_mut(id)?;
        match &mut handle.slot {
            TorrentSlot::Running { command_tx, .. } => {
                command_tx.send(CommandToTorrent::Stop).map_err(|_| SessionError::ChannelClosed)
            }
            TorrentSlot::Idle(_) | TorrentSlot::Transitioning => Ok(()),
        }
    }

    pub async fn verify(&mut self, id: &TorrentId) -> Result<()> {
        let handle = self.handle_mut(id)?;
        match &mut handle.slot {
            TorrentSlot::Running { command_tx, .. } => {
                command_tx.send(CommandToTorrent::Verify).map_err(|_| SessionError::ChannelClosed)
            }
            TorrentSlot::Idle(torrent) => {
                torrent.verify();
                Ok(())
            }
            TorrentSlot::Transitioning => Ok(()),
        }
    }

    pub async fn set_priority(&mut self, id: &TorrentId, file_indices: Vec<usize>, priority: Priority) -> Result<()> {
        let handle = self.handle_mut(id)?;
        match &mut handle.slot {
            TorrentSlot::Running { command_tx, .. } => {
                let (tx, rx) = oneshot::channel();
                command_tx.send(CommandToTorrent::SetPriority { file_indices, priority, tx }).map_err(|_| SessionError::ChannelClosed)?;
                rx.await.map_err(|_| SessionError::ChannelClosed)?.map_err(SessionError::from)
            }
            TorrentSlot::Idle(torrent) => torrent.set_priority(&file_indices, priority).await.map_err(SessionError::from),
            TorrentSlot::Transitioning => Ok(()),
        }
    }

    pub async fn set_wanted(&mut self, id: &TorrentId, file_indices: Vec<usize>, wanted: bool) -> Result<()> {
        let handle = self.handle_mut(id)?;
        match &mut handle.slot {
            TorrentSlot::Running { command_tx, .. } => {
                let (tx, rx) = oneshot::channel();
                command_tx.send(CommandToTorrent::SetWanted { file_indices, wanted, tx }).map_err(|_| SessionError::ChannelClosed)?;
                rx.await.map_err(|_| SessionError::ChannelClosed)?.map_err(SessionError::from)
            }
            TorrentSlot::Idle(torrent) => torrent.set_wanted(&file_indices, wanted).await.map_err(SessionError::from),
            TorrentSlot::Transitioning => Ok(()),
        }
    }

    pub async fn set_location(&mut self, id: &TorrentId, new_path: PathBuf) -> Result<()> {
        {
            let handle = self.handle_mut(id)?;
            match &mut handle.slot {
                TorrentSlot::Running { command_tx, .. } => {
                    let (tx, rx) = oneshot::channel();
                    command_tx.send(CommandToTorrent::MoveData { new_path: new_path.clone(), tx }).map_err(|_| SessionError::ChannelClosed)?;
                    rx.await.map_err(|_| SessionError::ChannelClosed)?.map_err(SessionError::from)?;
                }
                TorrentSlot::Idle(torrent) => {
                    torrent.move_data(new_path.clone()).await.map_err(SessionError::from)?;
                }
                TorrentSlot::Transitioning => {}
            }
        }
        self.handle_mut(id)?.save_path = new_path;
        Ok(())
    }

    pub async fn status(&mut self, id: &TorrentId) -> Result<TorrentStats> {
        let handle = self.handle_mut(id)?;
        match &mut handle.slot {
            TorrentSlot::Running { command_tx, .. } => {
                let (tx, rx) = oneshot::channel();
                command_tx.send(CommandToTorrent::Status { tx }).map_err(|_| SessionError::ChannelClosed)?;
                rx.await.map_err(|_| SessionError::ChannelClosed)
            }
            TorrentSlot::Idle(torrent) => Ok(torrent.status().await),
            TorrentSlot::Transitioning => Err(SessionError::ChannelClosed),
        }
    }

    /// Stops (if running) and removes a torrent, optionally deleting its
    /// downloaded data, then drops its resume file and queue slot.
    pub async fn remove(&mut self, id: &TorrentId, trash_data: bool) -> Result<()> {
        if let Some(handle) = self.torrents.remove(id) {
            let save_path = handle.save_path.clone();
            match handle.slot {
                TorrentSlot::Running { command_tx, join } => {
                    let _ = command_tx.send(CommandToTorrent::Stop);
                    let _ = join.await;
                }
                TorrentSlot::Idle(_) | TorrentSlot::Transitioning => {}
            }
            if trash_data {
                let _ = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(save_path)).await;
            }
        }
        self.queue.remove(id);
        ResumeFile::remove(&self.state_dir, id)?;
        Ok(())
    }

    pub fn queue_position(&self, id: &TorrentId) -> Option<usize> {
        self.queue.get_pos(id)
    }

    pub fn set_queue_position(&mut self, id: &TorrentId, pos: usize) {
        self.queue.set_pos(id, pos);
    }

    /// How many torrents (by queue position) are allowed to actively
    /// download/seed right now, per `queue_size_download`/`queue_size_seed`.
    pub fn download_slots(&self) -> usize {
        self.config.queue_size_download as usize
    }

    pub fn seed_slots(&self) -> usize {
        self.config.queue_size_seed as usize
    }

    fn ids(&self) -> Vec<TorrentId> {
        self.torrents.keys().copied().collect()
    }

    /// Queries every torrent's status and emits a `StatsTick` event for
    /// each. Not self-driven: the embedder calls this on its own interval
    /// (a UI refresh tick, an RPC poll) rather than the session spawning
    /// its own timer, since how often stats are needed is a UI concern.
    pub async fn tick_stats(&mut self) {
        for id in self.ids() {
            if let Ok(stats) = self.status(&id).await {
                let _ = self.event_tx.send(SessionEvent::StatsTick(id, Arc::new(stats)));
            }
        }
    }

    /// Snapshots every torrent's durable state to `<info-hash>.resume` and
    /// rewrites `queue.json`. Called periodically and on graceful shutdown.
    pub async fn checkpoint(&mut self) -> Result<()> {
        for id in self.ids() {
            let stats = match self.status(&id).await {
                Ok(s) => s,
                Err(_) => continue,
            };
            let (save_path, added_date) = {
                let handle = self.handle_mut(&id)?;
                (handle.save_path.clone(), handle.added_date)
            };
            let rf = ResumeFile {
                info_hash: id.to_vec(),
                bitfield: Vec::new(),
                file_wanted: Vec::new(),
                downloaded: stats.throughput.down.total(),
                uploaded: stats.throughput.up.total(),
                added_date,
                queue_position: self.queue.get_pos(&id).unwrap_or(0),
                last_peers: stats.peer_stats.iter().map(|p| p.address).collect(),
                save_path,
            };
            rf.save(&self.state_dir)?;
        }
        self.queue.save(&self.state_dir)?;
        Ok(())
    }

    /// Gracefully stops every torrent and waits for their tasks to exit.
    pub async fn shutdown(mut self) -> Result<()> {
        self.checkpoint().await?;
        for (_, handle) in self.torrents.drain() {
            if let TorrentSlot::Running { command_tx, join } = handle.slot {
                let _ = command_tx.send(CommandToTorrent::Stop);
                let _ = join.await;
            }
        }
        Ok(())
    }
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Coarsens a torrent task's terminal error for `SessionEvent::Error`,
/// emitted by whoever awaits its `JoinHandle` (see `spawn_running`).
fn classify(err: &torrent::TorrentError) -> ErrorKind {
    match err {
        torrent::TorrentError::PickerError(e) => ErrorKind::ProtocolError(e.to_string()),
        torrent::TorrentError::DiskError(e) => ErrorKind::IoError(e.to_string()),
        torrent::TorrentError::IoError(e) => ErrorKind::IoError(e.to_string()),
        torrent::TorrentError::Channel(s) => ErrorKind::IoError(s.clone()),
    }
}
