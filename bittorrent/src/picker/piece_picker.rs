use crate::Bitfield;

/*
A better strategy is to download pieces in rarest first order. The client can determine this
by keeping the initial bitfield from each peer, and updating it with every have message.
Then, the client can download the pieces that appear least frequently in these peer bitfields.
Note that any Rarest First strategy should include randomization among at least several of the
least common pieces, as having many clients all attempting to jump on the same "least common"
piece would be counter productive
*/

/// Per-piece download priority. `Blocked` pieces are never selected, even
/// if they're the rarest available (used to pause a file within a
/// multi-file torrent without cancelling in-flight requests for it).
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Blocked,
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Clone, Copy, Default, Debug)]
struct PieceInfo {
    // Number of peers that have this piece.
    frequency: usize,
    // Is the piece partially downloaded.
    is_partial: bool,
    priority: Priority,
}

#[derive(Debug)]
pub struct PiecePicker {
    // All pieces in the torrent, idx aligned.
    pieces: Vec<PieceInfo>,
    // The pieces that we have.
    have: Bitfield,
}

impl PiecePicker {
    
    pub fn new(num_pieces: usize) -> Self {
        let mut have = Bitfield::new();
        have.resize(num_pieces, false);
        Self {
            pieces: vec![PieceInfo::default(); num_pieces],
            have,
        }
    }

    pub fn own_bitfield(&self) -> &Bitfield {
        &self.have
    }

    pub fn all(&self) -> bool {
        self.have.all()
    }
    
    pub fn set_own_bitfield(&mut self, bf: Bitfield) {
        debug_assert_eq!(bf.len(), self.have.len());
        self.have = bf;
    }

    pub fn increment_piece(&mut self, idx: usize) -> bool {
        assert!(idx < self.pieces.len());
        self.pieces[idx].frequency += 1;
        self.have[idx]
    }

    pub fn received_piece(&mut self, idx: usize) {
        assert!(idx < self.pieces.len());
        self.have.set(idx, true);
    }

    // Will return true if there is at least one piece that peer has and we don't.
    pub fn bitfield_update(&mut self, bf: &Bitfield) -> bool {
        debug_assert_eq!(bf.len(), self.have.len());
        let mut interested = false;
        bf
            .iter()
            .enumerate()
            .filter(|(_, b)| **b)
            .for_each(|(i, _)| {
                self.pieces[i].frequency += 1;
                if !self.have[i] {
                    interested = true;
                }
        });
        interested
    }

    /// Picks the next piece to start downloading from `bf` (pieces the peer
    /// has): highest priority first, then rarest (lowest frequency) among
    /// equal priority, ties broken by piece index.
    pub fn pick_new_piece(&mut self, bf: &Bitfield) -> Option<usize> {
        let idx = self
            .pieces
            .iter()
            .enumerate()
            .filter(|(idx, piece)| {
                !self.have[*idx]
                    && !piece.is_partial
                    && piece.frequency > 0
                    && piece.priority != Priority::Blocked
                    && bf[*idx]
            })
            .max_by_key(|(idx, piece)| (piece.priority, std::cmp::Reverse(piece.frequency), std::cmp::Reverse(*idx)))
            .map(|(idx, _)| idx)?;

        self.pieces[idx].is_partial = true;
        Some(idx)
    }

    /// Sets the download priority of a piece; `Blocked` pieces are skipped
    /// by `pick_new_piece` regardless of rarity.
    pub fn set_priority(&mut self, idx: usize, priority: Priority) {
        assert!(idx < self.pieces.len());
        self.pieces[idx].priority = priority;
    }

    pub fn priority(&self, idx: usize) -> Priority {
        self.pieces[idx].priority
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitvec::prelude::*;

    #[test]
    fn picks_rarest_piece_first() {
        let mut picker = PiecePicker::new(3);
        let bf = BitVec::<u8, Msb0>::repeat(true, 3);
        // Piece 0 seen by 3 peers, piece 1 by 1, piece 2 by 2.
        for _ in 0..3 { picker.increment_piece(0); }
        picker.increment_piece(1);
        for _ in 0..2 { picker.increment_piece(2); }

        assert_eq!(picker.pick_new_piece(&bf), Some(1));
    }

    #[test]
    fn blocked_piece_is_never_picked() {
        let mut picker = PiecePicker::new(2);
        let bf = BitVec::<u8, Msb0>::repeat(true, 2);
        picker.increment_piece(0);
        picker.increment_piece(1);
        picker.set_priority(0, Priority::Blocked);

        assert_eq!(picker.pick_new_piece(&bf), Some(1));
    }

    #[test]
    fn high_priority_wins_over_rarity() {
        let mut picker = PiecePicker::new(2);
        let bf = BitVec::<u8, Msb0>::repeat(true, 2);
        // Piece 0 is rarer but normal priority; piece 1 is common but high.
        picker.increment_piece(0);
        for _ in 0..5 { picker.increment_piece(1); }
        picker.set_priority(1, Priority::High);

        assert_eq!(picker.pick_new_piece(&bf), Some(1));
    }

    #[test]
    fn ties_broken_by_lowest_index() {
        let mut picker = PiecePicker::new(3);
        let bf = BitVec::<u8, Msb0>::repeat(true, 3);
        for idx in 0..3 {
            picker.increment_piece(idx);
        }
        assert_eq!(picker.pick_new_piece(&bf), Some(0));
    }
}