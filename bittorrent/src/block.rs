use std::sync::Arc;
use crate::{store::StoreInfo, BLOCK_SIZE};

/// A block request descriptor: which piece, which offset within it, and
/// how many bytes. This is the unit the picker hands out and the active
/// request index tracks; it carries no payload.
#[derive(Debug, Hash, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub struct BlockInfo {
    pub piece_idx: usize,
    pub offset: usize,
    pub len: usize,
}

impl BlockInfo {
    #[inline]
    pub fn idx_in_piece(&self) -> usize {
        self.offset / BLOCK_SIZE
    }

    /// A request is valid if it addresses an in-range piece, a block-aligned
    /// offset, and a length that doesn't run past the end of the piece.
    pub fn is_valid(&self, info: &StoreInfo) -> bool {
        if self.piece_idx >= info.num_pieces as usize {
            return false;
        }
        let piece_len = info.piece_length(self.piece_idx);
        self.offset % BLOCK_SIZE == 0
            && self.offset < piece_len
            && self.len > 0
            && self.offset + self.len <= piece_len
    }

    pub fn from_block(block: &Block) -> BlockRequest {
        BlockRequest {
            piece_idx: block.piece_idx,
            offset: block.offset,
            len: block.data.len(),
        }
    }
}

/// Alias for the descriptor form used when tracking outstanding requests;
/// distinct name at call sites that care about "a request" rather than
/// "a region of a piece".
pub type BlockRequest = BlockInfo;

/// A block's payload, either freshly decoded off the wire or shared out of
/// the disk read cache without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockData {
    Owned(Vec<u8>),
    Cached(Arc<Vec<u8>>),
}

impl BlockData {
    pub fn len(&self) -> usize {
        match self {
            BlockData::Owned(data) => data.len(),
            BlockData::Cached(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            BlockData::Owned(data) => data,
            BlockData::Cached(data) => data,
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        match self {
            BlockData::Owned(data) => data,
            BlockData::Cached(data) => (*data).clone(),
        }
    }
}

/// Bytes of an in-flight or completed block, addressed by the piece it
/// belongs to and its offset within that piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub piece_idx: usize,
    pub offset: usize,
    pub data: BlockData,
}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_idx: self.piece_idx,
            offset: self.offset,
            len: self.data.len(),
        }
    }
}

/// A byte position restated three equivalent ways: absolute offset into
/// the torrent, and piece/block coordinates. Conversions between the
/// three are total functions of `piece_len` (always `BLOCK_SIZE`-aligned
/// except for a torrent's final piece).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub piece_idx: usize,
    pub piece_offset: usize,
}

impl Location {
    pub fn from_byte(byte: u64, piece_len: usize) -> Self {
        let piece_len = piece_len as u64;
        Self {
            piece_idx: (byte / piece_len) as usize,
            piece_offset: (byte % piece_len) as usize,
        }
    }

    pub fn to_byte(self, piece_len: usize) -> u64 {
        self.piece_idx as u64 * piece_len as u64 + self.piece_offset as u64
    }

    pub fn block_idx(self) -> usize {
        self.piece_offset / BLOCK_SIZE
    }

    pub fn block_offset(self) -> usize {
        self.piece_offset % BLOCK_SIZE
    }
}

/// Length in bytes of block `block_idx` within a piece of length
/// `piece_len`; every block is `BLOCK_SIZE` except possibly the last one
/// in the piece, which may be short.
pub fn block_len(piece_len: usize, block_idx: usize) -> usize {
    BLOCK_SIZE.min(piece_len - (block_idx * BLOCK_SIZE))
}

/// Number of blocks a piece of length `piece_len` is divided into.
pub fn num_blocks(piece_len: usize) -> u32 {
    ((piece_len + (BLOCK_SIZE - 1)) / BLOCK_SIZE) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_len() {
        let normal_piece_len = 32_768;
        let last_piece_len = 24_930;
        let normal_block_len = 16_384;
        let last_block_len = 8546;
        assert_eq!(block_len(normal_piece_len, 0), normal_block_len);
        assert_eq!(block_len(normal_piece_len, 1), normal_block_len);
        assert_eq!(block_len(last_piece_len, 0), normal_block_len);
        assert_eq!(block_len(last_piece_len, 1), last_block_len);
    }

    #[test]
    fn test_num_blocks() {
        (0..12).for_each(|i| assert_eq!(num_blocks(BLOCK_SIZE * i), i as u32));
        assert_eq!(num_blocks(BLOCK_SIZE + 500), 2);
        assert_eq!(num_blocks(BLOCK_SIZE * 5 + 1000), 6);
        assert_eq!(num_blocks(0), 0);
    }

    #[test]
    fn byte_location_round_trips() {
        let piece_len = 32_768;
        for byte in [0u64, 1, 16_384, 32_767, 32_768, 100_000] {
            let loc = Location::from_byte(byte, piece_len);
            assert_eq!(loc.to_byte(piece_len), byte);
        }
    }

    #[test]
    fn block_span_covers_whole_piece() {
        let piece_len = 32_768 + 5_000;
        let n = num_blocks(piece_len) as usize;
        let total: usize = (0..n).map(|b| block_len(piece_len, b)).sum();
        assert_eq!(total, piece_len);
    }

    #[test]
    fn block_data_len_matches_regardless_of_owned_or_cached() {
        let owned = BlockData::Owned(vec![1, 2, 3, 4]);
        let cached = BlockData::Cached(Arc::new(vec![1, 2, 3, 4]));
        assert_eq!(owned.len(), cached.len());
        assert_eq!(owned.as_slice(), cached.as_slice());
    }

    #[test]
    fn from_block_derives_matching_request() {
        let block = Block {
            piece_idx: 3,
            offset: BLOCK_SIZE * 2,
            data: BlockData::Owned(vec![0; BLOCK_SIZE]),
        };
        let request = BlockInfo::from_block(&block);
        assert_eq!(request, block.info());
        assert_eq!(request.len, BLOCK_SIZE);
    }
}
