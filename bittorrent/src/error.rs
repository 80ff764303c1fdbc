//! Crate-level error classification surfaced to embedders through the event
//! stream. Per-module errors (`MetaInfoError`, `TrackerError`, `fs::Error`,
//! ...) carry the detail an operator needs to debug; `ErrorKind` is the
//! coarse tag an embedder switches on without knowing every module's types.

use crate::{metainfo::MetaInfoError, picker::PickerError, tracker::TrackerError};

#[derive(Debug, thiserror::Error)]
pub enum ErrorKind {

    /// A manifest, resume file, or wire message was not valid bencode, or
    /// decoded to a structurally invalid value.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// A peer violated the wire protocol (bad handshake, illegal message
    /// for the current state, oversized payload).
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A downloaded piece failed its SHA-1 check.
    #[error("hash mismatch for piece {piece_idx}")]
    HashMismatch { piece_idx: usize },

    /// Filesystem I/O failed (disk full, permission denied, path error).
    #[error("io error: {0}")]
    IoError(String),

    /// A tracker request failed or returned an error string.
    #[error("tracker error: {0}")]
    TrackerError(String),

    /// A config value was invalid (bad listen port, empty download dir).
    #[error("config error: {0}")]
    ConfigError(String),

    /// An in-flight operation was cancelled (torrent removed, verify worker
    /// stopped) before it completed; not a failure in itself.
    #[error("cancelled")]
    Cancelled,
}

impl From<MetaInfoError> for ErrorKind {
    fn from(e: MetaInfoError) -> Self {
        match e {
            MetaInfoError::BencodeError(_)
            | MetaInfoError::InvalidExtension
            | MetaInfoError::InvalidPiecesLength
            | MetaInfoError::InvalidPieceLength(_)
            | MetaInfoError::FileNoSize
            | MetaInfoError::FileEmptyPath
            | MetaInfoError::FileAbsolutePath(_)
            | MetaInfoError::FilePathTraversal(_)
            | MetaInfoError::MissingInfo => ErrorKind::MalformedInput(e.to_string()),
            MetaInfoError::IoError(_) => ErrorKind::IoError(e.to_string()),
        }
    }
}

impl From<TrackerError> for ErrorKind {
    fn from(e: TrackerError) -> Self {
        match e {
            TrackerError::IoError(_) => ErrorKind::IoError(e.to_string()),
            TrackerError::BencodeError(_) => ErrorKind::MalformedInput(e.to_string()),
            _ => ErrorKind::TrackerError(e.to_string()),
        }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(e: std::io::Error) -> Self {
        ErrorKind::IoError(e.to_string())
    }
}

impl From<PickerError> for ErrorKind {
    fn from(e: PickerError) -> Self {
        // Only raised when a peer's `Have`/bitfield/request names a piece
        // index outside the torrent: a protocol violation, not our bug.
        ErrorKind::ProtocolError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metainfo_errors_classify_as_malformed_input() {
        let err: ErrorKind = MetaInfoError::InvalidPiecesLength.into();
        assert!(matches!(err, ErrorKind::MalformedInput(_)));
    }

    #[test]
    fn picker_errors_classify_as_protocol_error() {
        let err: ErrorKind = PickerError::InvalidPieceIndex(9999).into();
        assert!(matches!(err, ErrorKind::ProtocolError(_)));
    }
}
