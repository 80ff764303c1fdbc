//! On-disk persistence for a `Session`: one bencoded `<info-hash>.resume`
//! file per torrent (have-bitfield, priorities, counters, queue position,
//! last-known peers) plus a single `queue.json` recording torrent order.
//! Queue bookkeeping is grounded on `torrent-queue.cc`'s `tr_torrent_queue`:
//! a flat `Vec` permutation with `add`/`remove`/`get_pos`/`set_pos`, rotated
//! rather than fully resorted on `set_pos` so the relative order of every
//! other torrent is preserved.

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
};
use serde_derive::{Deserialize, Serialize};
use crate::ID;

#[derive(Debug, thiserror::Error)]
pub enum ResumeError {

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("queue.json error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ResumeError>;

/// Per-file download intent, persisted alongside the have-bitfield so a
/// resumed torrent doesn't re-request files the operator had deselected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum WantedState {
    Wanted,
    Skipped,
}

/// Snapshot of a single torrent's durable state, bencoded to
/// `<info-hash>.resume` in the session's resume directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResumeFile {

    // Redundant with the filename, kept inline so the file is
    // self-describing (e.g. after a manual copy between resume dirs).
    #[serde(with = "serde_bytes")]
    pub info_hash: Vec<u8>,

    // Piece bitfield, MSB-first, one bit per piece.
    #[serde(with = "serde_bytes")]
    pub bitfield: Vec<u8>,

    pub file_wanted: Vec<WantedState>,

    pub downloaded: u64,

    pub uploaded: u64,

    // Unix timestamp (seconds) the torrent was first added.
    pub added_date: i64,

    pub queue_position: usize,

    // Addresses of peers connected at last shutdown, for faster reconnect.
    pub last_peers: Vec<SocketAddr>,

    pub save_path: PathBuf,
}

impl ResumeFile {
    pub fn path(resume_dir: &Path, info_hash: &ID) -> PathBuf {
        resume_dir.join(format!("{}.resume", hex::encode(info_hash)))
    }

    pub fn load(resume_dir: &Path, info_hash: &ID) -> Result<Self> {
        let raw = std::fs::read(Self::path(resume_dir, info_hash))?;
        Ok(bencode::decode_bytes(&raw)?)
    }

    pub fn save(&self, resume_dir: &Path) -> Result<()> {
        let info_hash: ID = self.info_hash.clone().try_into().unwrap_or_default();
        std::fs::create_dir_all(resume_dir)?;
        let raw = bencode::encode_to_raw(self)?;
        std::fs::write(Self::path(resume_dir, &info_hash), raw)?;
        Ok(())
    }

    pub fn remove(resume_dir: &Path, info_hash: &ID) -> Result<()> {
        match std::fs::remove_file(Self::path(resume_dir, info_hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// The permutation of torrent ids persisted to `queue.json`, and the
/// in-memory order the session consults to decide which torrents are
/// allowed to actively download/seed under `queue_size_download`/
/// `queue_size_seed`.
#[derive(Debug, Default)]
pub struct Queue {
    order: Vec<ID>,
    pos_cache: HashMap<ID, usize>,
}

impl Queue {

    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the end of the queue, returning the assigned position.
    pub fn add(&mut self, id: ID) -> usize {
        self.order.push(id);
        let pos = self.order.len() - 1;
        self.pos_cache.insert(id, pos);
        pos
    }

    pub fn remove(&mut self, id: &ID) {
        if let Some(pos) = self.order.iter().position(|t| t == id) {
            self.order.remove(pos);
            self.pos_cache.remove(id);
            // Everything after the removed slot shifted down by one.
            for (_, cached) in self.pos_cache.iter_mut() {
                if *cached > pos {
                    *cached -= 1;
                }
            }
        }
    }

    pub fn get_pos(&self, id: &ID) -> Option<usize> {
        self.pos_cache.get(id).copied()
    }

    /// Moves `id` to `new_pos`, rotating the torrents between its old and
    /// new slot rather than re-sorting, so their relative order is kept.
    pub fn set_pos(&mut self, id: &ID, new_pos: usize) {
        let Some(old_pos) = self.get_pos(id) else { return };
        let new_pos = new_pos.min(self.order.len().saturating_sub(1));
        if old_pos == new_pos {
            return;
        }

        if old_pos < new_pos {
            self.order[old_pos..=new_pos].rotate_left(1);
        } else {
            self.order[new_pos..=old_pos].rotate_right(1);
        }

        for (pos, t) in self.order.iter().enumerate() {
            self.pos_cache.insert(*t, pos);
        }
    }

    pub fn order(&self) -> &[ID] {
        &self.order
    }

    fn file_path(session_dir: &Path) -> PathBuf {
        session_dir.join("queue.json")
    }

    pub fn load(session_dir: &Path) -> Result<Self> {
        let path = Self::file_path(session_dir);
        if !path.exists() {
            return Ok(Self::new());
        }
        let raw = std::fs::read(path)?;
        let hexes: Vec<String> = serde_json::from_slice(&raw)?;
        let mut queue = Self::new();
        for hex_str in hexes {
            if let Ok(bytes) = hex::decode(&hex_str) {
                if let Ok(id) = ID::try_from(bytes) {
                    queue.add(id);
                }
            }
        }
        Ok(queue)
    }

    pub fn save(&self, session_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(session_dir)?;
        let hexes: Vec<String> = self.order.iter().map(hex::encode).collect();
        let raw = serde_json::to_vec_pretty(&hexes)?;
        std::fs::write(Self::file_path(session_dir), raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> ID {
        let mut id = [0u8; 20];
        id[0] = b;
        id
    }

    #[test]
    fn queue_preserves_permutation_on_set_pos() {
        let mut q = Queue::new();
        for i in 0..5 {
            q.add(id(i));
        }
        q.set_pos(&id(4), 1);
        assert_eq!(q.order(), &[id(0), id(4), id(1), id(2), id(3)]);
        for (pos, t) in q.order().to_vec().iter().enumerate() {
            assert_eq!(q.get_pos(t), Some(pos));
        }
    }

    #[test]
    fn queue_remove_shifts_positions() {
        let mut q = Queue::new();
        for i in 0..3 {
            q.add(id(i));
        }
        q.remove(&id(0));
        assert_eq!(q.get_pos(&id(1)), Some(0));
        assert_eq!(q.get_pos(&id(2)), Some(1));
        assert_eq!(q.get_pos(&id(0)), None);
    }

    #[test]
    fn resume_file_round_trips_through_bencode() {
        let rf = ResumeFile {
            info_hash: id(7).to_vec(),
            bitfield: vec![0b1010_0000],
            file_wanted: vec![WantedState::Wanted, WantedState::Skipped],
            downloaded: 1024,
            uploaded: 0,
            added_date: 1_700_000_000,
            queue_position: 2,
            last_peers: vec![],
            save_path: PathBuf::from("/downloads/foo"),
        };
        let dir = tempfile::tempdir().unwrap();
        rf.save(dir.path()).unwrap();
        let loaded = ResumeFile::load(dir.path(), &id(7)).unwrap();
        assert_eq!(loaded.downloaded, 1024);
        assert_eq!(loaded.queue_position, 2);
    }
}
