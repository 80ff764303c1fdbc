use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, RwLock},
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, oneshot};
use crate::{
    p2p::{PeerHandle, PeerCommand, state::{ConnState, SessionState}},
    tracker::{TrackersHandle, Event, AnnounceParams},
    metainfo::MetaInfo,
    picker::{Picker, PickerError, Priority},
    store::StoreInfo,
    stats::{TorrentStats, PieceStats, PeerStats, ThroughputStats},
    verify,
    fs,
};
pub use crate::config::TorrentConfig;
use crate::config::EncryptionMode;

#[derive(Debug, thiserror::Error)]
pub enum TorrentError {

    #[error("picker error: {0}")]
    PickerError(#[from] PickerError),

    #[error("disk error: {0}")]
    DiskError(#[from] fs::DiskError),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("channel error: {0}")]
    Channel(String),
}

impl<T> From<mpsc::error::SendError<T>> for TorrentError {
    fn from(e: mpsc::error::SendError<T>) -> Self {
        TorrentError::Channel(e.to_string())
    }
}

/// High-level lifecycle state of a torrent, surfaced to embedders via
/// `TorrentStats`. `Checking` always precedes `Downloading`/`Seeding`: a
/// torrent never trusts a persisted have-map without re-verifying it first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TorrentState {
    #[default]
    Stopped,
    Starting,
    Checking,
    Downloading,
    Seeding,
}

// Type aliases.
pub type Result<T> = std::result::Result<T, TorrentError>;
pub type TorrentTx = mpsc::UnboundedSender<CommandToTorrent>;
pub type TorrentRx = mpsc::UnboundedReceiver<CommandToTorrent>;

// Commands that can be sent to a torrent from other tasks.
pub enum CommandToTorrent {

    // Sent by disk task when piece written.
    PieceWritten { idx: usize, valid: bool },

    // Sent by a peer session whenever its state changes (for stats); a
    // `state.conn_state == Disconnected` message is a peer's very last one.
    PeerState { address: SocketAddr, state: SessionState },

    // Sent by a tracker tier task when an announce returns new peers.
    PeersFound(Vec<SocketAddr>),

    // Sent by the verify worker's mediator once a piece has been re-checked.
    PieceVerified { idx: usize, valid: bool },

    // Sent by the verify worker's mediator once a full-torrent check ends.
    VerifyDone { aborted: bool },

    // Requests a graceful stop; sent by whoever holds a `command_tx` clone.
    Stop,

    // External control surface: a `Session` drives a torrent exclusively
    // through these, since the `Torrent` itself is owned by its `run` task.
    SetPriority { file_indices: Vec<usize>, priority: Priority, tx: oneshot::Sender<Result<()>> },

    SetWanted { file_indices: Vec<usize>, wanted: bool, tx: oneshot::Sender<Result<()>> },

    MoveData { new_path: PathBuf, tx: oneshot::Sender<Result<()>> },

    Verify,

    Status { tx: oneshot::Sender<TorrentStats> },

}

#[derive(Debug)]
pub struct Torrent {

    // Context is a read-only state accessible by peers in threads.
    ctx: Arc<TorrentContext>,

    // Peers we have active sessions with.
    peers: HashMap<SocketAddr, PeerHandle>,

    // Last known cumulative up/down byte totals per peer, so a
    // disconnect's zeroed-out final state doesn't lose history: see
    // `handle_peer_state`.
    peer_last_totals: HashMap<SocketAddr, (u64, u64)>,

    // Handle to the tracker tier tasks.
    trackers: TrackersHandle,

    // Handle to the background piece-verification task.
    verify_worker: verify::Worker,

    // Peers we know about but don't have a session with.
    available: Vec<SocketAddr>,

    // Receiver for commands.
    torrent_rx: TorrentRx,

    // Sender for commands; cloned out via `command_tx` for external control.
    torrent_tx: TorrentTx,

    // Current lifecycle state.
    state: TorrentState,

    // Time when torrent started.
    start_time: Option<Instant>,

    // Address to listen for incoming connections on.
    listen_address: SocketAddr,

    // How often to re-announce to trackers absent a state change.
    announce_interval: Duration,

    // Handle for disk task.
    // Option is for moving out of the handle behind a mutable ref.
    disk_handle: Option<tokio::task::JoinHandle<fs::Result<()>>>,

    // Minimum and maximum peers desired for the torrent.
    min_max_peers: (u32, u32),

    // Cumulative byte counters across every peer this torrent has ever had,
    // including ones that have since disconnected.
    throughput: ThroughputStats,

}

#[derive(Debug)]
pub struct TorrentContext {

    // The info hash for this torrent.
    pub info_hash: [u8; 20],

    // The client ID for this client.
    pub client_id: [u8; 20],

    // Allows for peers to pick next block to download.
    pub picker: Picker,

    // Commands to the peer.
    pub torrent_tx: TorrentTx,

    // // Commands to disk.
    pub disk_tx: fs::DiskTx,

    // Torrent storage information.
    pub info: StoreInfo,

    // Shared bandwidth limiters handed down by the owning `Session`; `None`
    // when run standalone (tests, or a session with no speed limit set).
    pub down_limiter: Option<Arc<leaky_bucket::RateLimiter>>,

    pub up_limiter: Option<Arc<leaky_bucket::RateLimiter>>,

    // Lifecycle/progress events fan out to a `Session`'s event stream when
    // set; `None` when a torrent is driven directly (tests, standalone use).
    pub session_tx: Option<crate::session::SessionEventTx>,

    // Whether peer sessions attempt message stream encryption.
    pub encryption_mode: EncryptionMode,

    // Addresses of peers we currently hold a session with; read by peer
    // sessions to build their periodic ut_pex added/dropped exchange.
    pub known_peers: RwLock<HashSet<SocketAddr>>,

}

impl Torrent {

    // This probably shouldnt be async, it is at the moment because Disk::new() is.
    pub async fn new(metainfo: MetaInfo, config: TorrentConfig) -> Self {
        Self::with_context(metainfo, config, None, None, None).await
    }

    /// Like `new`, but attaches the `Session`-wide bandwidth limiters and
    /// event sink, so every peer session this torrent spawns draws from the
    /// same buckets and its lifecycle is visible to the owning `Session`.
    pub async fn with_context(
        metainfo: MetaInfo,
        config: TorrentConfig,
        down_limiter: Option<Arc<leaky_bucket::RateLimiter>>,
        up_limiter: Option<Arc<leaky_bucket::RateLimiter>>,
        session_tx: Option<crate::session::SessionEventTx>,
    ) -> Self {

        let info = StoreInfo::new(&metainfo, config.output_dir);
        let (torrent_tx, torrent_rx) = mpsc::unbounded_channel();
        // Change unwrap after moving disk outside of torrent.
        let (disk_handle, disk_tx) = fs::spawn(info.clone(), metainfo.piece_hashes(), torrent_tx.clone()).await.unwrap();

        Torrent {
            ctx: Arc::new(
                TorrentContext {
                    info_hash: metainfo.info_hash(),
                    client_id: config.client_id,
                    down_limiter,
                    up_limiter,
                    session_tx,
                    encryption_mode: config.encryption_mode,
                    known_peers: RwLock::new(HashSet::new()),
                    picker: Picker::new(
                        info.num_pieces,
                        info.piece_len,
                        info.last_piece_len
                    ),
                    torrent_tx: torrent_tx.clone(),
                    info,
                    disk_tx,
                }
            ),
            trackers: TrackersHandle::new(metainfo.tracker_tiers()),
            verify_worker: verify::Worker::spawn(),
            peers: HashMap::new(),
            peer_last_totals: HashMap::new(),
            available: Vec::new(),
            torrent_rx,
            torrent_tx,
            state: TorrentState::Stopped,
            start_time: None,
            listen_address: config.listen_address,
            announce_interval: config.announce_interval,
            disk_handle: Some(disk_handle),
            min_max_peers: config.min_max_peers,
            throughput: ThroughputStats::default(),
        }
    }

    /// Sender other tasks can hold onto to control this torrent (currently
    /// just `Stop`) while `start` is busy driving its own loop.
    pub fn command_tx(&self) -> TorrentTx {
        self.torrent_tx.clone()
    }

    pub fn state(&self) -> TorrentState {
        self.state
    }

    // Runs the torrent until it is stopped. Always begins with a full
    // recheck (`Checking`): a persisted have-map is never trusted blindly.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!("starting torrent");
        self.start_time = Some(Instant::now());
        self.state = TorrentState::Starting;
        self.emit(crate::session::SessionEvent::Started(self.ctx.info_hash));
        self.trackers.start(self.torrent_tx.clone()).await;
        self.begin_verify();
        self.run().await
    }

    fn emit(&self, event: crate::session::SessionEvent) {
        if let Some(tx) = &self.ctx.session_tx {
            let _ = tx.send(event);
        }
    }

    fn begin_verify(&mut self) {
        self.state = TorrentState::Checking;
        let mediator: Arc<dyn verify::Mediator> = Arc::new(TorrentMediator { ctx: self.ctx.clone() });
        self.verify_worker.add(mediator, verify::Priority::Normal);
    }

    /// Queues a full-torrent recheck; safe to call again while one is
    /// already in flight (the verify worker de-dupes on info-hash).
    pub fn verify(&mut self) {
        self.begin_verify();
    }

    /// Sets download priority for every piece the given files span.
    pub async fn set_priority(&self, file_indices: &[usize], priority: Priority) -> Result<()> {
        for &file_idx in file_indices {
            let pieces = self.ctx.info.file_piece_range(file_idx);
            for piece_idx in pieces {
                self.ctx.picker.set_priority(piece_idx, priority).await?;
            }
        }
        Ok(())
    }

    /// Convenience wrapper over `set_priority`: wanted files get `Normal`
    /// priority, unwanted ones are `Blocked` (never picked, never requested).
    pub async fn set_wanted(&self, file_indices: &[usize], wanted: bool) -> Result<()> {
        let priority = if wanted { Priority::Normal } else { Priority::Blocked };
        self.set_priority(file_indices, priority).await
    }

    /// Moves every torrent file onto `new_path`, preserving relative layout.
    pub async fn move_data(&mut self, new_path: PathBuf) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.ctx.disk_tx.send(fs::CommandToDisk::MoveData { new_dir: new_path, tx })?;
        rx.await.map_err(|_| TorrentError::Channel("disk task gone".to_string()))??;
        Ok(())
    }

    /// Stops the torrent if running, optionally deleting downloaded data.
    /// Consumes `self`: once removed there's nothing left to drive.
    pub async fn remove(mut self, trash_data: bool) -> Result<()> {
        if self.state != TorrentState::Stopped {
            self.teardown().await?;
        }
        if trash_data {
            let dir = self.ctx.info.output_dir.clone();
            let _ = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(dir)).await;
        }
        Ok(())
    }

    pub async fn status(&self) -> TorrentStats {
        let num_downloaded = self.ctx.picker.piece_picker.read().await.own_bitfield().count_ones();
        let num_pending = self.ctx.picker.partial_pieces.read().await.len();

        TorrentStats {
            start_time: self.start_time,
            time_elapsed: self.start_time.map(|t| t.elapsed()).unwrap_or_default(),
            state: self.state,
            piece_stats: PieceStats {
                num_pieces: self.ctx.info.num_pieces as usize,
                num_pending,
                num_downloaded,
            },
            peer_stats: self.peers.iter().map(|(address, peer)| PeerStats {
                address: *address,
                state: peer.state,
            }).collect(),
            throughput: self.throughput,
        }
    }

    /// Gracefully stops the torrent: direct call for whoever owns `&mut
    /// Torrent` outside of an active `start` call. A caller racing against
    /// `start` should instead send `CommandToTorrent::Stop` via `command_tx`.
    pub async fn stop(&mut self) -> Result<()> {
        self.teardown().await
    }

    #[tracing::instrument(skip(self), fields(num_peers = self.peers.len() + self.available.len()))]
    pub async fn announce(&mut self, event: Option<Event>) -> Result<()> {
        let num_peers = self.peers.len() + self.available.len();
        let num_want = if num_peers >= self.min_max_peers.0 as usize || event == Some(Event::Stopped) {
            None
        } else {
            Some((self.min_max_peers.1 as usize - num_peers).max(self.min_max_peers.0 as usize))
        };

        let params = AnnounceParams {
            info_hash: self.ctx.info_hash,
            client_id: self.ctx.client_id,
            port: self.listen_address.port(),
            uploaded: self.throughput.up.total(),
            downloaded: self.throughput.down.total(),
            left: self.bytes_left().await,
            event,
            num_want,
        };

        self.trackers.announce(params);
        tracing::trace!("announced with event {:?}, {} peers known", event, num_peers);
        Ok(())
    }

    // Bytes remaining to complete the torrent. Approximates every missing
    // piece as full-length, which overstates `left` by at most one piece
    // when the (shorter) last piece is still missing.
    async fn bytes_left(&self) -> u64 {
        let owned = self.ctx.picker.piece_picker.read().await.own_bitfield().count_ones() as u64;
        self.ctx.info.total_len.saturating_sub(owned * self.ctx.info.piece_len as u64)
    }

    fn connect_to_peers(&mut self) {
        let count = self.available.len().min((self.min_max_peers.1 as usize).saturating_sub(self.peers.len()));
        if count == 0 {
            return;
        }

        tracing::info!("connecting to {} peers", count);
        for address in self.available.drain(0..count) {
            self.ctx.known_peers.write().unwrap().insert(address);
            self.peers.insert(address, PeerHandle::start_session(address, self.ctx.clone(), None));
        }
    }

    #[tracing::instrument(skip_all, name = "torrent")]
    async fn run(&mut self) -> Result<()> {

        let listener = tokio::net::TcpListener::bind(&self.listen_address).await?;
        self.listen_address = listener.local_addr()?;
        tracing::info!("listening on {}", self.listen_address);

        let mut announce_ticker = tokio::time::interval(self.announce_interval);
        // The interval's first tick fires immediately; `begin_verify`
        // already kicked off the initial announce-on-completion, so skip it.
        announce_ticker.tick().await;

        // Top level torrent loop.
        loop { tokio::select! {

            new_peer_conn = listener.accept() => {
                let (stream, address) = match new_peer_conn {
                    Ok((stream, address)) => (stream, address),
                    Err(e) => {
                        tracing::warn!("inbound peer connection error: {}", e);
                        continue;
                    },
                };
                self.ctx.known_peers.write().unwrap().insert(address);
                self.peers.insert(address, PeerHandle::start_session(address, self.ctx.clone(), Some(stream)));
            }

            _ = announce_ticker.tick() => {
                if self.state == TorrentState::Downloading || self.state == TorrentState::Seeding {
                    self.announce(None).await?;
                    self.connect_to_peers();
                }
            }

            Some(cmd) = self.torrent_rx.recv() => {
                match cmd {

                    CommandToTorrent::PieceWritten { idx, valid } => {
                        self.handle_piece_write(idx, valid).await?;
                    },

                    CommandToTorrent::PeerState { address, state } => {
                        self.handle_peer_state(address, state);
                    },

                    CommandToTorrent::PeersFound(peers) => {
                        self.available.extend(peers);
                        self.connect_to_peers();
                    },

                    CommandToTorrent::PieceVerified { idx, valid } => {
                        if valid {
                            self.ctx.picker.piece_picker.write().await.received_piece(idx);
                        }
                    },

                    CommandToTorrent::VerifyDone { aborted } => {
                        self.handle_verify_done(aborted).await?;
                    },

                    CommandToTorrent::Stop => {
                        self.teardown().await?;
                        break;
                    },

                    CommandToTorrent::SetPriority { file_indices, priority, tx } => {
                        let _ = tx.send(self.set_priority(&file_indices, priority).await);
                    },

                    CommandToTorrent::SetWanted { file_indices, wanted, tx } => {
                        let _ = tx.send(self.set_wanted(&file_indices, wanted).await);
                    },

                    CommandToTorrent::MoveData { new_path, tx } => {
                        let _ = tx.send(self.move_data(new_path).await);
                    },

                    CommandToTorrent::Verify => {
                        self.verify();
                    },

                    CommandToTorrent::Status { tx } => {
                        let _ = tx.send(self.status().await);
                    },
                }
            }
        }}

        Ok(())
    }

    async fn teardown(&mut self) -> Result<()> {
        tracing::info!("tearing down torrent");
        self.state = TorrentState::Stopped;

        self.verify_worker.remove(self.ctx.info_hash).await;

        for peer in self.peers.values() {
            let _ = peer.peer_tx.send(PeerCommand::Shutdown);
        }
        for (_, peer) in self.peers.drain() {
            if let Err(e) = peer.session_handle.await {
                tracing::warn!("peer session task panicked: {}", e);
            }
        }

        self.ctx.disk_tx.send(fs::CommandToDisk::Shutdown)?;
        if let Some(handle) = self.disk_handle.take() {
            handle.await.map_err(|_| TorrentError::Channel("disk task panicked".to_string()))??;
        }

        // Announce stopped event to trackers before dropping the sender
        // that gives them their exit signal.
        self.announce(Some(Event::Stopped)).await?;
        self.trackers.shutdown().await;

        self.emit(crate::session::SessionEvent::Stopped(self.ctx.info_hash));
        Ok(())
    }

    /// Folds a peer's cumulative throughput into the torrent-wide total by
    /// delta against its last known totals, since `disconnect` sends a
    /// zeroed-out final `SessionState` that would otherwise erase its
    /// history from a naive resummation.
    fn handle_peer_state(&mut self, address: SocketAddr, state: SessionState) {
        if state.conn_state == ConnState::Disconnected {
            self.peers.remove(&address);
            self.peer_last_totals.remove(&address);
            self.ctx.known_peers.write().unwrap().remove(&address);
            return;
        }

        let (last_up, last_down) = self.peer_last_totals.get(&address).copied().unwrap_or_default();
        let up_total = state.throughput.up.total();
        let down_total = state.throughput.down.total();
        self.throughput.up.add(up_total.saturating_sub(last_up));
        self.throughput.down.add(down_total.saturating_sub(last_down));
        self.peer_last_totals.insert(address, (up_total, down_total));

        if let Some(peer) = self.peers.get_mut(&address) {
            peer.state = state;
        }
    }

    async fn handle_verify_done(&mut self, aborted: bool) -> Result<()> {
        if aborted {
            return Ok(());
        }

        let num_missing = self.ctx.picker.piece_picker.read().await.own_bitfield().count_zeros();
        self.state = if num_missing == 0 { TorrentState::Seeding } else { TorrentState::Downloading };
        tracing::info!("verification complete: {:?}, {} pieces missing", self.state, num_missing);

        let event = if self.state == TorrentState::Seeding { Some(Event::Completed) } else { Some(Event::Started) };
        self.announce(event).await?;
        self.connect_to_peers();

        self.emit(crate::session::SessionEvent::Verified(self.ctx.info_hash, 0..self.ctx.info.num_pieces as usize));
        if self.state == TorrentState::Seeding {
            self.emit(crate::session::SessionEvent::Completed(self.ctx.info_hash));
        }
        Ok(())
    }

    async fn handle_piece_write(&mut self, idx: usize, valid: bool) -> Result<()> {

        if valid {

            self.ctx.picker.partial_pieces.write().await.remove(&idx);
            self.ctx.picker.piece_picker.write().await.received_piece(idx);

            let num_pieces_missing = self.ctx.picker.piece_picker.read().await.own_bitfield().count_zeros();
            tracing::info!("piece {} downloaded, {} pieces remain", idx, num_pieces_missing);

            for peer in self.peers.values() {
                let _ = peer.peer_tx.send(PeerCommand::PieceWritten(idx));
            }
            self.emit(crate::session::SessionEvent::PieceComplete(self.ctx.info_hash, idx));

            if num_pieces_missing == 0 && self.state != TorrentState::Seeding {
                tracing::info!("torrent download complete, entering seed state");
                self.state = TorrentState::Seeding;
                self.announce(Some(Event::Completed)).await?;
                self.emit(crate::session::SessionEvent::Completed(self.ctx.info_hash));
            }

        } else {
            // Hash mismatch: free the piece's blocks and strike every peer
            // that delivered one, so a consistently corrupting peer's
            // reliability score drops and it stops being picked from.
            if let Some(piece) = self.ctx.picker.partial_pieces.read().await.get(&idx) {
                let mut piece = piece.write().await;
                for peer in piece.contributors() {
                    self.ctx.picker.strike_peer(*peer).await;
                }
                piece.free_all_blocks();
            }
        }

        Ok(())
    }
}

// The concrete `verify::Mediator` a `Torrent` hands its background verifier:
// piece checks round-trip through the same disk actor that owns every other
// file read, rather than the verifier holding raw file handles of its own.
struct TorrentMediator {
    ctx: Arc<TorrentContext>,
}

#[async_trait::async_trait]
impl verify::Mediator for TorrentMediator {
    fn info_hash(&self) -> [u8; 20] {
        self.ctx.info_hash
    }

    fn piece_count(&self) -> usize {
        self.ctx.info.num_pieces as usize
    }

    fn total_size(&self) -> u64 {
        self.ctx.info.total_len
    }

    async fn check_piece(&self, idx: usize) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.ctx.disk_tx.send(fs::CommandToDisk::VerifyPiece { idx, tx }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    fn on_piece_checked(&self, idx: usize, has_piece: bool) {
        let _ = self.ctx.torrent_tx.send(CommandToTorrent::PieceVerified { idx, valid: has_piece });
    }

    fn on_verify_done(&self, aborted: bool) {
        let _ = self.ctx.torrent_tx.send(CommandToTorrent::VerifyDone { aborted });
    }
}
