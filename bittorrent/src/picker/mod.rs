use std::{collections::{HashSet, HashMap}, net::SocketAddr, time::{Duration, Instant}};
use tokio::sync::RwLock;
use crate::{block::BlockRequest, Bitfield};

pub mod piece_picker;
pub mod partial_piece;
pub mod requests;
pub mod reliability;

pub use piece_picker::Priority;
use piece_picker::PiecePicker;
use partial_piece::PartialPiece;
use requests::ActiveRequests;
use reliability::Reliability;

#[derive(thiserror::Error, Debug)]
pub enum PickerError {
    #[error("piece index {0} out of range")]
    InvalidPieceIndex(usize),
}

/// How many blocks may be missing before we lift `duplicate_limit` and let
/// more than one peer race to deliver the same handful of remaining blocks.
const DEFAULT_ENDGAME_THRESHOLD: usize = 20;

/// How many distinct peers may have the same block outstanding at once,
/// outside endgame.
const DEFAULT_DUPLICATE_LIMIT: usize = 1;

#[derive(Debug)]
pub struct Picker {
    pub piece_picker:   RwLock<PiecePicker>,
    pub partial_pieces: RwLock<HashMap<usize, RwLock<PartialPiece>>>,
    // Every block request outstanding to any peer, for de-dup and timeouts.
    pub active_requests: RwLock<ActiveRequests>,
    // Failed-delivery strikes per peer.
    pub reliability:    RwLock<Reliability>,
    num_pieces:         u32,
    piece_len:          usize,
    last_piece_len:     usize,
    duplicate_limit:    usize,
    endgame_threshold:  usize,
}

impl Picker {

    pub fn new(num_pieces: u32, piece_len: usize, last_piece_len: usize) -> Self {
        Self {
            piece_picker: RwLock::new(PiecePicker::new(num_pieces as usize)),
            partial_pieces: RwLock::new(HashMap::new()),
            active_requests: RwLock::new(ActiveRequests::new()),
            reliability: RwLock::new(Reliability::new()),
            num_pieces,
            piece_len,
            last_piece_len,
            duplicate_limit: DEFAULT_DUPLICATE_LIMIT,
            endgame_threshold: DEFAULT_ENDGAME_THRESHOLD,
        }
    }

    pub async fn set_priority(&self, idx: usize, priority: Priority) -> Result<(), PickerError> {
        if idx as u32 >= self.num_pieces {
            return Err(PickerError::InvalidPieceIndex(idx));
        }
        self.piece_picker.write().await.set_priority(idx, priority);
        Ok(())
    }

    /// Number of blocks still missing across all partially downloaded
    /// pieces. Pieces not yet started at all are deliberately excluded:
    /// while any of those remain, picking is never endgame regardless of
    /// this count.
    async fn partial_free_block_count(&self) -> usize {
        let mut missing = 0;
        for partial_piece in self.partial_pieces.read().await.values() {
            missing += partial_piece.read().await.free_block_count();
        }
        missing
    }

    pub async fn pick_blocks(
        &self,
        peer: SocketAddr,
        current_requests: &HashSet<BlockRequest>,
        target_queue_len: usize,
        bf: &Bitfield,
    ) -> Vec<BlockRequest> {

        let mut requests = vec![];
        let mut remaining = target_queue_len.saturating_sub(current_requests.len());
        if remaining == 0 {
            return vec![];
        }
        let mut endgame = false;

        // Attempt to pick blocks from partially downloaded pieces.
        for partial_piece in self.partial_pieces.write().await.values_mut() {

            // Target queue length reached.
            if remaining == 0 {
                break;
            }

            // Skip pieces that peer does not have.
            if !bf[partial_piece.read().await.idx as usize] {
                continue;
            }

            remaining -= partial_piece
                .write()
                .await
                .pick_next_blocks(remaining, &mut requests, current_requests, false);
        }

        // Pick blocks from new pieces.
        while remaining != 0 {

            if let Some(idx) = self.piece_picker.write().await.pick_new_piece(bf) {
                tracing::trace!("picked piece {}", idx);
                // Begin a new partial piece.
                let mut partial_piece = PartialPiece::new(idx, if idx as u32 == self.num_pieces - 1 { self.last_piece_len } else { self.piece_len });
                remaining -= partial_piece.pick_next_blocks(remaining, &mut requests, current_requests, false);
                self.partial_pieces.write().await.insert(idx, partial_piece.into());

            } else if self.partial_free_block_count().await <= self.endgame_threshold {
                // No fresh piece left to start, and the pieces already in
                // flight are down to their last few blocks: endgame.
                endgame = true;
                for partial_piece in self.partial_pieces.write().await.values_mut() {

                    if remaining == 0 {
                        break;
                    }
                    if !bf[partial_piece.read().await.idx as usize] {
                        continue;
                    }

                    remaining -= partial_piece
                        .write()
                        .await
                        .pick_next_blocks(remaining, &mut requests, current_requests, true);
                }
                break;
            } else {
                break;
            }
        }

        // Record every picked request in the active-request index, subject
        // to the duplicate limit (the partial-piece-level checks above
        // already avoid re-offering a block that's hit the limit, but a
        // block could reach the limit between two calls to this peer's
        // own request loop and a concurrent one for another peer).
        let duplicate_limit = if endgame { usize::MAX } else { self.duplicate_limit };
        let now = Instant::now();
        let mut active = self.active_requests.write().await;
        requests.retain(|request| {
            if active.duplicate_count(request) < duplicate_limit {
                active.insert(*request, peer, now);
                true
            } else {
                false
            }
        });

        requests
    }

    /// A peer disconnected or was choked; release every block it had
    /// requested back to `missing` unless another peer is also holding it
    /// (endgame).
    pub async fn release_peer(&self, peer: SocketAddr) {
        let freed = self.active_requests.write().await.remove_peer(peer);
        if freed.is_empty() {
            return;
        }
        let partial_pieces = self.partial_pieces.read().await;
        for request in freed {
            if let Some(partial_piece) = partial_pieces.get(&request.piece_idx) {
                partial_piece.write().await.free_block(&request);
            }
        }
    }

    /// Called by a peer session once a request is satisfied or cancelled,
    /// so the active-request index doesn't grow unbounded and so the
    /// duplicate-limit check sees it as free again if re-requested.
    pub async fn request_settled(&self, request: &BlockRequest, peer: SocketAddr) {
        self.active_requests.write().await.remove(request, peer);
    }

    /// Scans for requests older than `timeout`; the caller (per-peer tick)
    /// is responsible for sending cancels and recording peer failures for
    /// whichever of the returned `(request, peer)` pairs belong to it.
    pub async fn timed_out_requests(&self, timeout: Duration) -> Vec<(BlockRequest, SocketAddr)> {
        self.active_requests.read().await.expired(Instant::now(), timeout)
    }

    /// Records a failed-delivery strike against `peer`, returning its new
    /// total. Called on a hash-verification failure (for every peer that
    /// contributed a block to the piece) and on a request timeout.
    pub async fn strike_peer(&self, peer: SocketAddr) -> u32 {
        self.reliability.write().await.strike(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;
    use bitvec::prelude::*;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 6881))
    }

    #[tokio::test]
    async fn test_pick_blocks() {
        let picker = Picker::new(1028, 32_768, 32_768);
        let bf = BitVec::repeat(true, 1028);
        picker.piece_picker.write().await.bitfield_update(&bf);
        let requests_1 = picker.pick_blocks(peer(), &HashSet::new(), 4, &bf).await;
        assert_eq!(requests_1.len(), 4);
        let requests_2 = picker.pick_blocks(peer(), &HashSet::new(), 4, &bf).await;
        assert_eq!(requests_2.len(), 4);
    }

    #[tokio::test]
    async fn test_pick_blocks_end_game() {

        let picker = Picker::new(2, 32_768, 32_768);
        let bf = BitVec::repeat(true, 2);
        picker.piece_picker.write().await.bitfield_update(&bf);

        // Pick all the blocks.
        let requests_1 = picker.pick_blocks(peer(), &HashSet::new(), 4, &bf).await;
        assert_eq!(requests_1.len(), 4);

        // Try endgame.
        let requests_2 = picker.pick_blocks(peer(), &HashSet::new(), 4, &bf).await;
        assert_eq!(requests_2.len(), 4);

        // Endgame with blocks already in queue.
        let mut previous_requests = HashSet::new();
        previous_requests.insert(BlockRequest { piece_idx: 0, offset: 0, len: BLOCK_SIZE });
        previous_requests.insert(BlockRequest { piece_idx: 1, offset: 0, len: BLOCK_SIZE });
        let requests_3 = picker.pick_blocks(peer(), &previous_requests, 4, &bf).await;
        assert_eq!(requests_3.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_limit_blocks_a_second_peer_outside_endgame() {
        let picker = Picker::new(64, 32_768, 32_768);
        let bf = BitVec::repeat(true, 64);
        picker.piece_picker.write().await.bitfield_update(&bf);

        let peer_a = SocketAddr::from(([127, 0, 0, 1], 1));
        let peer_b = SocketAddr::from(([127, 0, 0, 1], 2));

        let requests_a = picker.pick_blocks(peer_a, &HashSet::new(), 2, &bf).await;
        assert_eq!(requests_a.len(), 2);

        // Plenty of untouched pieces remain, so peer B should get fresh
        // blocks rather than duplicates of peer A's, outside endgame.
        let requests_b = picker.pick_blocks(peer_b, &HashSet::new(), 2, &bf).await;
        assert_eq!(requests_b.len(), 2);
        for request in &requests_b {
            assert!(!requests_a.contains(request), "peer B was offered a duplicate outside endgame");
        }
    }

    #[tokio::test]
    async fn release_peer_frees_its_sole_requests() {
        let picker = Picker::new(4, 32_768, 32_768);
        let bf = BitVec::repeat(true, 4);
        picker.piece_picker.write().await.bitfield_update(&bf);

        let requests = picker.pick_blocks(peer(), &HashSet::new(), 2, &bf).await;
        assert_eq!(picker.active_requests.read().await.len(), 2);

        picker.release_peer(peer()).await;
        assert!(picker.active_requests.read().await.is_empty());

        // The freed blocks go back to `Free` and can be picked again.
        let requests_again = picker.pick_blocks(peer(), &HashSet::new(), 2, &bf).await;
        assert_eq!(requests_again, requests);
    }
}
