//! Session-wide and per-torrent configuration. `SessionConfig` is new,
//! added for the embedder surface; `TorrentConfig` keeps the teacher's
//! fields (it previously existed in two places — here, unused, and again
//! inline in `torrent.rs` — consolidated to this single definition).

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    /// Never negotiate MSE; refuse peers that require it.
    Disabled,
    /// Attempt MSE first, fall back to plaintext handshake.
    Preferred,
    /// Refuse peers that won't negotiate MSE.
    Required,
}

impl Default for EncryptionMode {
    fn default() -> Self { EncryptionMode::Preferred }
}

#[derive(Debug, Clone)]
pub struct TorrentConfig {

    /// Unique 20-byte identifier used by this client.
    pub client_id: [u8; 20],

    pub output_dir: PathBuf,

    pub listen_address: SocketAddr,

    pub announce_interval: Duration,

    /// The minimum and maximum peers desired for the torrent.
    pub min_max_peers: (u32, u32),

    /// Whether peer sessions for this torrent attempt message stream
    /// encryption.
    pub encryption_mode: EncryptionMode,

}

const DEFAULT_CLIENT_ID: [u8; 20] = *b"-RS0133-73b3b0b0b0b0";

impl Default for TorrentConfig {
    fn default() -> Self {
        Self {
            client_id: DEFAULT_CLIENT_ID,
            output_dir: PathBuf::from("downloads"),
            listen_address: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 6881),
            announce_interval: Duration::from_secs(1800),
            min_max_peers: (5, 100),
            encryption_mode: EncryptionMode::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {

    /// TCP port this session listens for incoming peer connections on.
    pub peer_port: u16,

    /// When true, pick a random port instead of `peer_port` at startup.
    pub peer_port_random: bool,

    /// Max number of simultaneous peer connections across all torrents.
    pub peer_limit_global: u32,

    /// Max number of simultaneous peer connections for any one torrent.
    pub peer_limit_per_torrent: u32,

    /// Download bandwidth cap in bytes/sec, `None` for unlimited.
    pub speed_limit_down: Option<u64>,

    /// Upload bandwidth cap in bytes/sec, `None` for unlimited.
    pub speed_limit_up: Option<u64>,

    /// Seed ratio at which a torrent transitions out of `Seeding`; `None`
    /// to seed indefinitely.
    pub ratio_limit: Option<f64>,

    /// Seconds a torrent may sit idle (no upload activity) while seeding
    /// before it is stopped; `None` to disable.
    pub idle_seeding_limit: Option<u64>,

    /// Default directory completed downloads are moved/written into.
    pub download_dir: PathBuf,

    /// Directory in-progress downloads are written into; defaults to
    /// `download_dir` when unset.
    pub incomplete_dir: Option<PathBuf>,

    pub dht_enabled: bool,

    pub pex_enabled: bool,

    pub lpd_enabled: bool,

    pub utp_enabled: bool,

    pub encryption_mode: EncryptionMode,

    /// Number of torrents allowed to download simultaneously; the rest
    /// queue (see `resume::QueuePosition`).
    pub queue_size_download: u32,

    /// Number of torrents allowed to seed simultaneously.
    pub queue_size_seed: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            peer_port: 51413,
            peer_port_random: false,
            peer_limit_global: 200,
            peer_limit_per_torrent: 50,
            speed_limit_down: None,
            speed_limit_up: None,
            ratio_limit: None,
            idle_seeding_limit: None,
            download_dir: PathBuf::from("."),
            incomplete_dir: None,
            dht_enabled: true,
            pex_enabled: true,
            lpd_enabled: false,
            utp_enabled: false,
            encryption_mode: EncryptionMode::Preferred,
            queue_size_download: 5,
            queue_size_seed: 5,
        }
    }
}

impl SessionConfig {
    /// Directory a given torrent should currently write into.
    pub fn active_dir(&self) -> &std::path::Path {
        self.incomplete_dir.as_deref().unwrap_or(&self.download_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_dir_falls_back_to_download_dir() {
        let cfg = SessionConfig { download_dir: PathBuf::from("/downloads"), ..Default::default() };
        assert_eq!(cfg.active_dir(), std::path::Path::new("/downloads"));
    }

    #[test]
    fn incomplete_dir_overrides_when_set() {
        let cfg = SessionConfig {
            download_dir: PathBuf::from("/downloads"),
            incomplete_dir: Some(PathBuf::from("/incomplete")),
            ..Default::default()
        };
        assert_eq!(cfg.active_dir(), std::path::Path::new("/incomplete"));
    }
}
