#![allow(dead_code)]

mod metainfo;
mod store;
mod torrent;
mod tracker;
mod p2p;
mod fs;
mod block;
mod picker;
mod de;
mod sanitize;
mod config;
mod error;
mod stats;
mod verify;
mod session;
mod resume;
mod builder;

const BLOCK_SIZE: usize = 0x4000;

type Bitfield = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

/// A 20-byte SHA-1 digest: an info-hash, a piece hash, or a peer/client id.
pub type ID = [u8; 20];

pub use metainfo::{MetaInfo, MetaInfoError, Info, File as MetaInfoFile};
pub use builder::{MetaInfoBuilder, BuilderError};
pub use torrent::{Torrent, TorrentState};
pub use config::{EncryptionMode, SessionConfig, TorrentConfig};
pub use error::ErrorKind;
pub use session::{Session, SessionError, SessionEvent, SessionEventTx, SessionEventRx, InitialState, TorrentId};
pub use picker::Priority;
pub use stats::TorrentStats;
pub use resume::{ResumeFile, Queue};