use std::{net::SocketAddr, time::{Duration, Instant}};
use rand::Rng;
use tokio::task::JoinHandle;
use tracing::Instrument;
use url::Url;
use crate::{torrent::{CommandToTorrent, TorrentTx}, ID};

mod http;
mod udp;
pub use udp::UdpTracker;
pub use http::HttpTracker;

type Result<T> = std::result::Result<T, TrackerError>;
pub type TrackerTx = tokio::sync::watch::Sender<Option<AnnounceParams>>;
pub type TrackerRx = tokio::sync::watch::Receiver<Option<AnnounceParams>>;

// In cases where the tracker doesn't give us a min interval.
const DEFAULT_MIN_ANNOUNCE_INTERVAL: u64 = 60; // seconds

/// Trackers report `interval`/`min interval` in raw seconds with no bound;
/// clamp whatever they say into a sane re-announce range so a
/// misconfigured or hostile tracker can't make us hammer it or go silent
/// for hours.
pub(super) const MIN_REANNOUNCE_INTERVAL: u64 = 60;
pub(super) const MAX_REANNOUNCE_INTERVAL: u64 = 3600;

pub(super) fn clamp_reannounce_interval(secs: u64) -> Duration {
    Duration::from_secs(secs.clamp(MIN_REANNOUNCE_INTERVAL, MAX_REANNOUNCE_INTERVAL))
}

/// Base unit of BEP 15's UDP retry schedule: attempt `n` waits
/// `15 * 2^n` seconds, giving up once `n` exceeds [`MAX_ANNOUNCE_RETRIES`].
const UDP_RETRY_BASE_SECS: u64 = 15;
const MAX_ANNOUNCE_RETRIES: u32 = 8;

/// Base of the general tracker-announce backoff: attempt `n` waits
/// `min(base * 2^n, 900s)`. Unlike [`Backoff`], a tier never gives up:
/// a tracker that's down for an hour should still be retried, just at the
/// capped interval.
const ANNOUNCE_RETRY_BASE_SECS: u64 = 10;
const MAX_ANNOUNCE_BACKOFF_SECS: u64 = 900;

#[derive(thiserror::Error, Debug)]
pub enum TrackerError {

    #[error("request error: {0}")]
    ReqwestError(#[from] reqwest::Error),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("error deserializing response: {0}")]
    BencodeError(#[from]bencode::Error),

    #[error("timeout")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("invalid url")]
    InvalidUrl,

    #[error("response error: {0}")]
    ResponseError(String),

    #[error("tier exhausted all {0} trackers")]
    TierExhausted(usize),

}

/// BEP 15 §"Time outs": on failure, wait `15 * 2^n` seconds before retrying,
/// for `n` in `0..=8`; beyond that the caller gives up on this attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn new() -> Self { Self { attempt: 0 } }

    pub fn exhausted(&self) -> bool { self.attempt > MAX_ANNOUNCE_RETRIES }

    /// Delay before the next retry, with up to 20% jitter so many torrents
    /// retrying the same tracker don't thunder-herd in lockstep.
    pub fn next_delay(&mut self) -> Duration {
        let base = UDP_RETRY_BASE_SECS * 2u64.pow(self.attempt.min(MAX_ANNOUNCE_RETRIES));
        self.attempt += 1;
        let jitter_frac: f64 = rand::thread_rng().gen_range(0.0..0.2);
        Duration::from_secs_f64(base as f64 * (1.0 + jitter_frac))
    }

    pub fn reset(&mut self) { self.attempt = 0; }
}

/// General tracker-announce backoff: grows exponentially from
/// [`ANNOUNCE_RETRY_BASE_SECS`], capped at [`MAX_ANNOUNCE_BACKOFF_SECS`],
/// and never exhausts. Used by a tier's announce loop when every tracker
/// in the tier fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnounceBackoff {
    attempt: u32,
}

impl AnnounceBackoff {
    pub fn new() -> Self { Self { attempt: 0 } }

    /// Delay before the next retry, with up to 20% jitter.
    pub fn next_delay(&mut self) -> Duration {
        let base = (ANNOUNCE_RETRY_BASE_SECS * 2u64.saturating_pow(self.attempt)).min(MAX_ANNOUNCE_BACKOFF_SECS);
        self.attempt = self.attempt.saturating_add(1);
        let jitter_frac: f64 = rand::thread_rng().gen_range(0.0..0.2);
        Duration::from_secs_f64(base as f64 * (1.0 + jitter_frac)).min(Duration::from_secs(MAX_ANNOUNCE_BACKOFF_SECS))
    }

    pub fn reset(&mut self) { self.attempt = 0; }
}

#[derive(Debug)]
pub struct TrackersHandle {

    tiers: Vec<Vec<Url>>,

    handles: Vec<JoinHandle<()>>,

    tracker_rx: TrackerRx,

    // `None` once `shutdown` has run: dropping the sender is what makes the
    // per-tier tasks' `rx.changed()` return an error and exit their loop.
    tracker_tx: Option<TrackerTx>,

}

impl TrackersHandle {

    pub fn new(tiers: Vec<Vec<Url>>) -> Self {
        let (tracker_tx, tracker_rx) = tokio::sync::watch::channel(None);
        Self { tiers, tracker_rx, tracker_tx: Some(tracker_tx), handles: Vec::new() }
    }

    /// Pushes new announce parameters out to every tier task. A no-op once
    /// `shutdown` has run.
    pub fn announce(&self, params: AnnounceParams) {
        if let Some(tx) = &self.tracker_tx {
            let _ = tx.send(Some(params));
        }
    }

    /// Spawns one task per tier. Each task walks its tier in order on every
    /// announce, promoting whichever tracker answers to the front and
    /// backing off (with jitter) when the whole tier fails.
    pub async fn start(&mut self, torrent_tx: TorrentTx) {
        let mut handles = vec![];

        for urls in self.tiers.iter() {
            let mut tier_trackers: Vec<Box<dyn Tracker>> = Vec::new();
            for url in urls {
                let tracker: Box<dyn Tracker> = match url.scheme() {
                    "http" | "https" => Box::new(HttpTracker::new(url.clone())),
                    "udp" => Box::new(UdpTracker::new(url.clone()).await),
                    scheme => {
                        tracing::warn!("unsupported tracker scheme: {}", scheme);
                        continue;
                    }
                };
                tier_trackers.push(tracker);
            }
            if tier_trackers.is_empty() {
                continue;
            }

            let tx = torrent_tx.clone();
            let mut rx = self.tracker_rx.clone();
            let handle = tokio::spawn(async move {
                let mut backoff = AnnounceBackoff::new();
                loop {
                    if rx.changed().await.is_err() {
                        return;
                    }
                    let params = *rx.borrow();
                    let Some(params) = params else { continue };
                    let time = Instant::now();

                    let mut announced = false;
                    for (idx, tracker) in tier_trackers.iter_mut().enumerate() {
                        if params.event.is_none() && !tracker.should_announce(time) && !tracker.can_announce(time) {
                            continue;
                        }
                        match tracker.announce(params).await {
                            Ok(peers) => {
                                if tx.send(CommandToTorrent::PeersFound(peers)).is_err() {
                                    return;
                                }
                                backoff.reset();
                                announced = true;
                                let winner = tier_trackers.remove(idx);
                                tier_trackers.insert(0, winner);
                                break;
                            }
                            Err(e) => {
                                tracing::warn!("tracker announce error: {}", e);
                            }
                        }
                    }

                    if !announced {
                        tokio::time::sleep(backoff.next_delay()).await;
                    }
                }
            }.instrument(tracing::info_span!("tracker_tier")));
            handles.push(handle);
        }

        self.handles = handles;
    }

    pub async fn shutdown(&mut self) {
        // Drop the sender so every tier task's `rx.changed()` errors out and
        // the task returns, instead of waiting on announces forever.
        self.tracker_tx = None;
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!("tracker join error: {}", e);
            };
        }
    }
}

#[async_trait::async_trait]
pub trait Tracker: Send + Sync {

    async fn announce(&mut self, params: AnnounceParams) -> Result<Vec<SocketAddr>>;

    fn can_announce(&self, time: Instant) -> bool;

    fn should_announce(&self, time: Instant) -> bool;

}

#[derive(Debug, Copy, Clone, Default)]
pub struct AnnounceParams {

    // Hash of info dict.
    pub info_hash:  ID,

    // Urlencoded 20-byte string used as a unique ID for the client.
    pub client_id:    ID,

    // Port number.
    pub port:       u16,

    // The total amount uploaded (since the client sent the 'started' event to the tracker) in base ten ASCII..
    pub uploaded:   u64,

    // The total amount downloaded (since the client sent the 'started' event to the tracker) in base ten ASCII..
    pub downloaded: u64,

    // The number of bytes this client still has to download in base ten ASCII.
    // Clarification: The number of bytes needed to download to be 100% complete and get all the included files in the torrent.
    pub left:       u64,

    // If specified, must be one of started, completed, stopped, (or empty which is the same as not being specified).
    // If not specified, then this request is one performed at regular intervals.
    pub event:     Option<Event>,

    // Number of peers that the client would like to receive from the tracker.
    pub num_want: Option<usize>,

}

#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub enum Event {

    Completed,

    #[default]
    Started,

    Stopped,

}

impl std::fmt::Display for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Event::Completed => write!(f, "completed"),
            Event::Started => write!(f, "started"),
            Event::Stopped => write!(f, "stopped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_gives_up() {
        let mut b = Backoff::new();
        let first = b.next_delay().as_secs_f64();
        let second = b.next_delay().as_secs_f64();
        assert!(second > first);
        for _ in 0..20 { b.next_delay(); }
        assert!(b.exhausted());
    }

    #[test]
    fn announce_backoff_caps_and_never_exhausts() {
        let mut b = AnnounceBackoff::new();
        for _ in 0..30 {
            let delay = b.next_delay().as_secs_f64();
            assert!(delay <= MAX_ANNOUNCE_BACKOFF_SECS as f64 * 1.2 + 1.0);
        }
    }

    #[test]
    fn clamp_reannounce_interval_bounds_both_sides() {
        assert_eq!(clamp_reannounce_interval(5), Duration::from_secs(MIN_REANNOUNCE_INTERVAL));
        assert_eq!(clamp_reannounce_interval(99_999), Duration::from_secs(MAX_REANNOUNCE_INTERVAL));
        assert_eq!(clamp_reannounce_interval(300), Duration::from_secs(300));
    }
}
