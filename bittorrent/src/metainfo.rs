use std::path::Path;

use rand::seq::SliceRandom;
use serde_derive::{Deserialize, Serialize};

use crate::sanitize;
use crate::store::FileInfo;
use crate::ID;

#[derive(Debug, thiserror::Error)]
pub enum MetaInfoError {

    #[error("bencode error whilst decoding metainfo: {0}")]
    BencodeError(#[from] bencode::Error),

    #[error("invalid file extension, expected .torrent")]
    InvalidExtension,

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("invalid pieces length, must be a nonzero multiple of 20")]
    InvalidPiecesLength,

    #[error("piece length {0} is not a power of two")]
    InvalidPieceLength(u32),

    #[error("file(s) with size 0")]
    FileNoSize,

    #[error("file(s) with no path")]
    FileEmptyPath,

    #[error("file path {0:?} is absolute")]
    FileAbsolutePath(String),

    #[error("file path {0:?} contains a '.' or '..' component")]
    FilePathTraversal(String),

    #[error("info dictionary missing or not a dictionary")]
    MissingInfo,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct File {
    pub path: Vec<String>,
    pub length: u64,
    pub md5sum: Option<String>,
}

impl File {
    fn validate(&self) -> Result<(), MetaInfoError> {
        if self.length == 0 {
            return Err(MetaInfoError::FileNoSize);
        }
        if self.path.is_empty() {
            return Err(MetaInfoError::FileEmptyPath);
        }
        for segment in &self.path {
            if segment.is_empty() {
                return Err(MetaInfoError::FileEmptyPath);
            }
            if Path::new(segment).is_absolute() {
                return Err(MetaInfoError::FileAbsolutePath(self.path.join("/")));
            }
            if segment == "." || segment == ".." {
                return Err(MetaInfoError::FilePathTraversal(self.path.join("/")));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Deserialize, Serialize)]
pub struct Info {
    pub name: String,

    #[serde(with = "serde_bytes")]
    pub pieces: Vec<u8>,

    #[serde(rename = "piece length")]
    pub piece_length: u32,

    #[serde(default)]
    pub md5sum: Option<String>,

    #[serde(default)]
    pub length: Option<u64>,

    #[serde(default)]
    pub files: Option<Vec<File>>,

    /// BEP 27: when set, the client must rely only on the trackers named in
    /// this manifest, never DHT or PEX.
    #[serde(default)]
    pub private: Option<u8>,

    #[serde(default)]
    #[serde(rename = "root hash")]
    pub root_hash: Option<String>,

    /// Non-standard but widely supported: ties a torrent to one private
    /// tracker even if the info dict is otherwise identical to a public
    /// release, so the two don't collide as the same info-hash/swarm.
    #[serde(default)]
    pub source: Option<String>,
}

impl Info {
    fn validate(&self) -> Result<(), MetaInfoError> {
        if self.pieces.is_empty() || self.pieces.len() % 20 != 0 {
            return Err(MetaInfoError::InvalidPiecesLength);
        }
        if !self.piece_length.is_power_of_two() {
            return Err(MetaInfoError::InvalidPieceLength(self.piece_length));
        }
        match &self.files {
            Some(files) => {
                for file in files {
                    file.validate()?;
                }
            }
            None => {
                if self.length.unwrap_or(0) == 0 {
                    return Err(MetaInfoError::FileNoSize);
                }
            }
        }
        Ok(())
    }

    pub fn is_private(&self) -> bool {
        self.private.unwrap_or(0) != 0
    }
}

#[derive(Deserialize, Clone)]
pub struct MetaInfo {

    #[serde(deserialize_with = "crate::de::url_deserialize")]
    pub announce: url::Url,

    pub info: Info,

    #[serde(skip)]
    pub info_hash: ID,

    #[serde(default)]
    pub encoding: Option<String>,

    #[serde(default)]
    #[serde(rename = "announce-list")]
    #[serde(deserialize_with = "crate::de::announce_list_deserialize")]
    pub announce_list: Option<Vec<Vec<url::Url>>>,

    #[serde(default)]
    #[serde(rename = "creation date")]
    pub creation_date: Option<i64>,

    #[serde(rename = "comment")]
    pub comment: Option<String>,

    #[serde(default)]
    #[serde(rename = "created by")]
    pub created_by: Option<String>,

    /// BEP 19 webseeds: HTTP/FTP URLs serving the same files as a fallback
    /// peer source.
    #[serde(default)]
    #[serde(rename = "url-list")]
    pub url_list: Option<Vec<String>>,

}

impl MetaInfo {

    pub fn new<P: AsRef<Path>>(path: P) -> Result<MetaInfo, MetaInfoError> {
        if path.as_ref().extension().unwrap_or_default() != "torrent" {
            return Err(MetaInfoError::InvalidExtension);
        }
        Self::parse(&std::fs::read(path)?)
    }

    /// Parses a raw `.torrent` buffer. The info-hash is computed from the
    /// literal bytes of the `info` dictionary (located without decoding it
    /// into `Info`, so unknown keys a future client added are still hashed
    /// correctly) rather than by re-encoding the typed struct.
    pub fn parse(raw: &[u8]) -> Result<MetaInfo, MetaInfoError> {
        let info_span = bencode::dict_entry_span(raw, b"info")
            .map_err(|_| MetaInfoError::MissingInfo)?;

        use sha1::Digest;
        let mut hasher = sha1::Sha1::new();
        hasher.update(&raw[info_span]);
        let info_hash: ID = hasher.finalize().into();

        let mut metainfo: MetaInfo = bencode::decode_bytes(raw)?;
        metainfo.info.validate()?;
        metainfo.info_hash = info_hash;

        tracing::debug!(info_hash = %metainfo.info_hash_hex(), "metainfo parsed");
        Ok(metainfo)
    }

    pub fn piece_hashes(&self) -> Vec<ID> {
        self.info.pieces
            .chunks_exact(20)
            .map(|c| c.try_into().unwrap())
            .collect()
    }

    pub fn piece_len(&self) -> usize { self.info.piece_length as usize }

    pub fn num_pieces(&self) -> u32 { self.info.pieces.len() as u32 / 20 }

    pub fn is_multi_file(&self) -> bool { self.info.files.is_some() }

    pub fn single_file_len(&self) -> Option<u64> { self.info.length }

    pub fn total_len(&self) -> u64 {
        if let Some(files) = &self.info.files {
            files.iter().map(|f| f.length).sum()
        } else {
            self.info.length.unwrap_or(0)
        }
    }

    pub fn info_hash(&self) -> ID { self.info_hash }

    pub fn is_private(&self) -> bool { self.info.is_private() }

    pub fn name(&self) -> &str { &self.info.name }

    /// Tracker URLs grouped into announce tiers (BEP 12), each tier shuffled
    /// so repeated runs don't hammer the same tracker first. Feeds directly
    /// into `tracker::TrackersHandle::new`.
    pub fn tracker_tiers(&self) -> Vec<Vec<url::Url>> {
        if let Some(announce_list) = self.announce_list.clone() {
            let mut tiers = announce_list;
            for tier in tiers.iter_mut() {
                tier.shuffle(&mut rand::thread_rng());
            }
            tiers
        } else {
            vec![vec![self.announce.clone()]]
        }
    }

    /// Adds `url` to tier `tier_idx`, appending a fresh tier if out of
    /// range. Returns the tier index the url landed in.
    pub fn add_tracker(&mut self, tier_idx: usize, url: url::Url) -> usize {
        let list = self.announce_list.get_or_insert_with(|| vec![vec![self.announce.clone()]]);
        if tier_idx >= list.len() {
            list.push(vec![url]);
            list.len() - 1
        } else {
            list[tier_idx].push(url);
            tier_idx
        }
    }

    /// Removes every occurrence of `url` across all tiers.
    pub fn remove_tracker(&mut self, url: &url::Url) {
        if let Some(list) = &mut self.announce_list {
            for tier in list.iter_mut() {
                tier.retain(|u| u != url);
            }
            list.retain(|tier| !tier.is_empty());
        }
    }

    /// Substring-replaces across every tracker URL in every tier.
    pub fn replace_tracker_substring(&mut self, old: &str, new: &str) {
        if let Some(list) = &mut self.announce_list {
            for tier in list.iter_mut() {
                for url in tier.iter_mut() {
                    if url.as_str().contains(old) {
                        if let Ok(replaced) = url::Url::parse(&url.as_str().replace(old, new)) {
                            *url = replaced;
                        }
                    }
                }
            }
        }
        if self.announce.as_str().contains(old) {
            if let Ok(replaced) = url::Url::parse(&self.announce.as_str().replace(old, new)) {
                self.announce = replaced;
            }
        }
    }

    pub fn files(&self) -> Vec<FileInfo> {
        if let Some(files) = &self.info.files {
            let mut offset = 0;
            files.iter().map(|f| {
                let sanitized_path: std::path::PathBuf = f.path.iter().map(|s| sanitize::sanitize(s)).collect();
                let file_info = FileInfo {
                    path: sanitized_path,
                    length: f.length as usize,
                    offset,
                    md5sum: f.md5sum.clone(),
                };
                offset += f.length as usize;
                file_info
            }).collect()
        } else {
            vec![FileInfo {
                path: sanitize::sanitize(&self.info.name).into(),
                length: self.info.length.unwrap_or(0) as usize,
                offset: 0,
                md5sum: None,
            }]
        }
    }

    pub fn creation_date_fmt(&self) -> Option<String> {
        self.creation_date.map(|v| {
            chrono::DateTime::from_timestamp(v, 0)
                .map(|v| v.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "invalid date".to_string())
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn size_fmt(&self) -> String {
        format_size(self.total_len())
    }

    /// Bencodes and writes this manifest back out, e.g. after `add_tracker`/
    /// `remove_tracker`/`replace_tracker_substring` edits.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), MetaInfoError> {
        let raw = bencode::encode_to_raw(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    let mut unit = "B";
    for next_unit in ["KiB", "MiB", "GiB", "TiB"] {
        if size <= 1024.0 {
            break;
        }
        size /= 1024.0;
        unit = next_unit;
    }
    format!("{size:.2} {unit}")
}

impl std::fmt::Debug for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaInfo")
            .field("announce", &self.announce.as_str())
            .field("info", &self.info)
            .field("info_hash", &self.info_hash_hex())
            .field("encoding", &self.encoding)
            .field("announce_list", &self.announce_list.as_ref().map(|v|
                v.iter().map(|v|
                    v.iter().map(|v| v.as_str()).collect()
                ).collect::<Vec<Vec<&str>>>()
            ))
            .field("creation_date", &self.creation_date_fmt())
            .field("comment", &self.comment)
            .field("created_by", &self.created_by)
            .finish()
    }
}

impl std::fmt::Debug for Info {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Info")
            .field("name", &self.name)
            .field("num pieces", &(self.pieces.len() / 20))
            .field("piece_length", &self.piece_length)
            .field("md5sum", &self.md5sum)
            .field("length", &self.length)
            .field("files", &self.files)
            .field("private", &self.private)
            .field("root_hash", &self.root_hash)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metainfo() {
        let metainfo = MetaInfo::new("tests/test_torrents/test_small.torrent").unwrap();
        assert_eq!(metainfo.num_pieces(), 1028);
        assert_eq!(metainfo.info.piece_length, 32_768);
        assert_eq!(metainfo.total_len(), 33_677_666);
        assert!(!metainfo.is_multi_file());
        assert_eq!(metainfo.info_hash_hex(), "f1a8db22ffe20c7014c6267b5f68b97fdc438b1a");
    }

    #[test]
    fn round_trip_produces_same_info_hash() {
        let raw = std::fs::read("tests/test_torrents/test_small.torrent").unwrap();
        let first = MetaInfo::parse(&raw).unwrap();
        let reencoded = bencode::encode_to_raw(&first).unwrap();
        let second = MetaInfo::parse(&reencoded).unwrap();
        assert_eq!(first.info_hash(), second.info_hash());
    }

    #[test]
    fn debug_meta_info() {
        let metainfo = MetaInfo::new("tests/test_torrents/test_multi.torrent").unwrap();
        println!("{metainfo:#?}");
        println!("{}", metainfo.total_len());
    }

    #[test]
    fn rejects_non_power_of_two_piece_length() {
        let info = Info {
            name: "x".into(),
            pieces: vec![0u8; 20],
            piece_length: 100,
            md5sum: None,
            length: Some(10),
            files: None,
            private: None,
            root_hash: None,
            source: None,
        };
        assert!(matches!(info.validate(), Err(MetaInfoError::InvalidPieceLength(_))));
    }
}
