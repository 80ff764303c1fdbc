//! Builds a fresh `.torrent` manifest from a file or directory. Grounded on
//! `utils/create.cc`'s `tr_metainfo_builder`: walk the input, pick a piece
//! size, hash every piece in file order, then hand back a `MetaInfo` ready
//! to bencode. This is the `cli create` subcommand's only real dependency
//! on the engine beyond the bencode codec itself.

use std::path::{Path, PathBuf};
use std::collections::VecDeque;
use sha1::Digest;
use crate::metainfo::{File, Info, MetaInfo};

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("bencode error: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("{0:?} contains no files")]
    Empty(PathBuf),

    #[error("private torrent needs at least one tracker")]
    PrivateNeedsTracker,

    #[error("piece size must be at least 16 KiB and a power of two")]
    InvalidPieceSize,
}

pub type Result<T> = std::result::Result<T, BuilderError>;

const MIN_PIECE_SIZE: u32 = 16 * 1024;
const MAX_PIECE_SIZE: u32 = 16 * 1024 * 1024;

pub struct MetaInfoBuilder {
    base_dir: PathBuf,
    name: String,
    files: Vec<(PathBuf, u64)>,
    total_size: u64,
    piece_size: u32,
    is_private: bool,
    source: Option<String>,
    comment: Option<String>,
    anonymize: bool,
    trackers: Vec<Vec<url::Url>>,
    webseeds: Vec<String>,
}

impl MetaInfoBuilder {

    pub fn new(input: impl AsRef<Path>) -> Result<Self> {
        let input = input.as_ref();
        let name = input.file_name().and_then(|s| s.to_str()).unwrap_or("unknown").to_string();

        let mut files = Vec::new();
        if input.is_dir() {
            let mut queue = VecDeque::from([input.to_path_buf()]);
            while let Some(dir) = queue.pop_front() {
                let mut entries: Vec<_> = std::fs::read_dir(&dir)?.collect::<std::io::Result<_>>()?;
                entries.sort_by_key(|e| e.file_name());
                for entry in entries {
                    let path = entry.path();
                    if path.is_dir() {
                        queue.push_back(path);
                    } else {
                        files.push((path.clone(), entry.metadata()?.len()));
                    }
                }
            }
        } else {
            files.push((input.to_path_buf(), std::fs::metadata(input)?.len()));
        }

        if files.is_empty() {
            return Err(BuilderError::Empty(input.to_path_buf()));
        }

        let total_size: u64 = files.iter().map(|(_, len)| len).sum();
        let piece_size = Self::preferred_piece_size(total_size);

        Ok(Self {
            base_dir: input.to_path_buf(),
            name,
            files,
            total_size,
            piece_size,
            is_private: false,
            source: None,
            comment: None,
            anonymize: false,
            trackers: Vec::new(),
            webseeds: Vec::new(),
        })
    }

    /// Aims for somewhere around 1000-1500 pieces, clamped to [16 KiB, 16
    /// MiB] and rounded up to a power of two; not the original's exact
    /// table, but the same shape of heuristic.
    fn preferred_piece_size(total_size: u64) -> u32 {
        let target = (total_size / 1500).max(MIN_PIECE_SIZE as u64);
        let mut size = MIN_PIECE_SIZE as u64;
        while size < target && size < MAX_PIECE_SIZE as u64 {
            size *= 2;
        }
        size as u32
    }

    pub fn file_count(&self) -> usize { self.files.len() }

    pub fn total_size(&self) -> u64 { self.total_size }

    pub fn piece_count(&self) -> usize {
        (self.total_size.div_ceil(self.piece_size as u64)).max(1) as usize
    }

    pub fn piece_size(&self) -> u32 { self.piece_size }

    pub fn set_piece_size(&mut self, bytes: u32) -> Result<()> {
        if bytes < MIN_PIECE_SIZE || !bytes.is_power_of_two() {
            return Err(BuilderError::InvalidPieceSize);
        }
        self.piece_size = bytes;
        Ok(())
    }

    pub fn set_private(&mut self, private: bool) { self.is_private = private; }

    pub fn set_source(&mut self, source: String) { self.source = Some(source); }

    pub fn set_comment(&mut self, comment: String) { self.comment = Some(comment); }

    pub fn set_anonymize(&mut self, anonymize: bool) { self.anonymize = anonymize; }

    pub fn set_webseeds(&mut self, webseeds: Vec<String>) { self.webseeds = webseeds; }

    /// Adds a tracker to tier `tier`, growing the tier list as needed.
    pub fn add_tracker(&mut self, tier: usize, url: url::Url) {
        while self.trackers.len() <= tier {
            self.trackers.push(Vec::new());
        }
        self.trackers[tier].push(url);
    }

    /// Reads every input file in order and hashes fixed-size pieces across
    /// file boundaries, exactly how a downloading peer reconstructs them.
    pub fn build(self) -> Result<MetaInfo> {
        if self.is_private && self.trackers.is_empty() {
            return Err(BuilderError::PrivateNeedsTracker);
        }

        let mut pieces = Vec::new();
        let mut hasher = sha1::Sha1::new();
        let mut buffered = 0usize;

        for (path, _) in &self.files {
            let data = std::fs::read(path)?;
            let mut offset = 0;
            while offset < data.len() {
                let take = (self.piece_size as usize - buffered).min(data.len() - offset);
                hasher.update(&data[offset..offset + take]);
                buffered += take;
                offset += take;
                if buffered == self.piece_size as usize {
                    pieces.extend_from_slice(&hasher.finalize_reset());
                    buffered = 0;
                }
            }
        }
        if buffered > 0 {
            pieces.extend_from_slice(&hasher.finalize_reset());
        }

        let single_file = self.files.len() == 1 && self.files[0].0 == self.base_dir;
        let files = if single_file {
            None
        } else {
            Some(self.files.iter().map(|(path, len)| File {
                path: path.strip_prefix(&self.base_dir)
                    .unwrap_or(path)
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect(),
                length: *len,
                md5sum: None,
            }).collect())
        };
        let single_length = single_file.then_some(self.total_size);

        let announce = self.trackers.first()
            .and_then(|tier| tier.first())
            .cloned()
            .unwrap_or_else(|| url::Url::parse("udp://0.0.0.0:0/announce").unwrap());
        let announce_list = (!self.trackers.is_empty()).then_some(self.trackers);

        let mut metainfo = MetaInfo {
            announce,
            info: Info {
                name: self.name,
                pieces,
                piece_length: self.piece_size,
                md5sum: None,
                length: single_length,
                files,
                private: self.is_private.then_some(1),
                root_hash: None,
                source: self.source,
            },
            info_hash: Default::default(),
            encoding: None,
            announce_list,
            creation_date: (!self.anonymize).then(|| chrono::Utc::now().timestamp()),
            comment: self.comment,
            created_by: (!self.anonymize).then(|| "bitrider".to_string()),
            url_list: (!self.webseeds.is_empty()).then_some(self.webseeds),
        };

        let raw = bencode::encode_to_raw(&metainfo)?;
        let info_span = bencode::dict_entry_span(&raw, b"info")
            .map_err(|_| BuilderError::Empty(self.base_dir.clone()))?;
        let mut hasher = sha1::Sha1::new();
        hasher.update(&raw[info_span]);
        metainfo.info_hash = hasher.finalize().into();

        Ok(metainfo)
    }

    pub fn save(metainfo: &MetaInfo, outfile: impl AsRef<Path>) -> Result<()> {
        let raw = bencode::encode_to_raw(metainfo)?;
        std::fs::write(outfile, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_single_file_torrent_with_correct_piece_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::write(&path, vec![7u8; 40_000]).unwrap();

        let mut builder = MetaInfoBuilder::new(&path).unwrap();
        builder.set_piece_size(16 * 1024).unwrap();
        builder.add_tracker(0, url::Url::parse("udp://tracker.example:80/announce").unwrap());
        let metainfo = builder.build().unwrap();

        assert_eq!(metainfo.total_len(), 40_000);
        assert_eq!(metainfo.num_pieces(), 3);
        assert!(!metainfo.is_multi_file());
    }

    #[test]
    fn private_torrent_without_tracker_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![1u8; 100]).unwrap();
        let mut builder = MetaInfoBuilder::new(dir.path()).unwrap();
        builder.set_private(true);
        assert!(matches!(builder.build(), Err(BuilderError::PrivateNeedsTracker)));
    }

    #[test]
    fn directory_input_produces_multi_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), vec![1u8; 100]).unwrap();
        std::fs::write(dir.path().join("b.bin"), vec![2u8; 200]).unwrap();
        let builder = MetaInfoBuilder::new(dir.path()).unwrap();
        assert_eq!(builder.file_count(), 2);
        assert_eq!(builder.total_size(), 300);
    }
}
