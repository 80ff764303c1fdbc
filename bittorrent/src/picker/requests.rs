use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    time::{Duration, Instant},
};
use crate::block::BlockRequest;

// One outstanding ask for a block, from one peer.
#[derive(Debug, Clone, Copy)]
struct Ask {
    peer: SocketAddr,
    requested_at: Instant,
}

/// The set of block requests currently in flight to any peer, across the
/// whole torrent. Modeled on `request-list.c`'s `request_list`: a FIFO of
/// insertion order (oldest-first, for timeout scanning) plus an index keyed
/// on the block itself (there, a sorted array probed by binary search; here,
/// a hash map, since we don't need `reqListPop`'s strict FIFO removal).
///
/// A block may have more than one `Ask` once in `Endgame`, where the
/// duplicate limit is lifted so several peers race to deliver it.
#[derive(Debug, Default)]
pub struct ActiveRequests {
    order: VecDeque<BlockRequest>,
    asks: HashMap<BlockRequest, Vec<Ask>>,
}

impl ActiveRequests {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// How many distinct peers have been asked for this block.
    pub fn duplicate_count(&self, request: &BlockRequest) -> usize {
        self.asks.get(request).map_or(0, Vec::len)
    }

    /// Records an ask for `request` from `peer`. Returns `false` (and just
    /// refreshes the timestamp) if `peer` already had this block in flight,
    /// `true` if this is a new ask.
    pub fn insert(&mut self, request: BlockRequest, peer: SocketAddr, now: Instant) -> bool {
        let is_new_block = !self.asks.contains_key(&request);
        let asks = self.asks.entry(request).or_default();
        if let Some(existing) = asks.iter_mut().find(|ask| ask.peer == peer) {
            existing.requested_at = now;
            return false;
        }
        if is_new_block {
            self.order.push_back(request);
        }
        asks.push(Ask { peer, requested_at: now });
        true
    }

    /// A request was satisfied or cancelled by `peer`; drop just their ask.
    pub fn remove(&mut self, request: &BlockRequest, peer: SocketAddr) {
        if let Some(asks) = self.asks.get_mut(request) {
            asks.retain(|ask| ask.peer != peer);
            if asks.is_empty() {
                self.asks.remove(request);
                self.order.retain(|r| r != request);
            }
        }
    }

    /// The block was fully received or its piece abandoned; drop every ask
    /// for it regardless of which peer made them.
    pub fn remove_all(&mut self, request: &BlockRequest) {
        if self.asks.remove(request).is_some() {
            self.order.retain(|r| r != request);
        }
    }

    /// Drops every ask made to `peer` (they disconnected); returns the
    /// blocks that now have zero outstanding asks, so the picker can mark
    /// them free again.
    pub fn remove_peer(&mut self, peer: SocketAddr) -> Vec<BlockRequest> {
        let mut freed = Vec::new();
        self.asks.retain(|request, asks| {
            asks.retain(|ask| ask.peer != peer);
            if asks.is_empty() {
                freed.push(*request);
                false
            } else {
                true
            }
        });
        self.order.retain(|r| !freed.contains(r));
        freed
    }

    /// Asks older than `timeout`, oldest first. The picker times these out
    /// on each tick: the peer gets a strike, the request is cancelled, and
    /// the block goes back to `missing`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<(BlockRequest, SocketAddr)> {
        let mut out = Vec::new();
        for request in &self.order {
            if let Some(asks) = self.asks.get(request) {
                for ask in asks {
                    if now.saturating_duration_since(ask.requested_at) >= timeout {
                        out.push((*request, ask.peer));
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BLOCK_SIZE;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn request() -> BlockRequest {
        BlockRequest { piece_idx: 0, offset: 0, len: BLOCK_SIZE }
    }

    #[test]
    fn insert_then_remove_drops_entry() {
        let mut requests = ActiveRequests::new();
        let now = Instant::now();
        requests.insert(request(), addr(1), now);
        assert_eq!(requests.duplicate_count(&request()), 1);
        requests.remove(&request(), addr(1));
        assert_eq!(requests.duplicate_count(&request()), 0);
        assert!(requests.is_empty());
    }

    #[test]
    fn duplicate_count_tracks_distinct_peers() {
        let mut requests = ActiveRequests::new();
        let now = Instant::now();
        requests.insert(request(), addr(1), now);
        requests.insert(request(), addr(2), now);
        assert_eq!(requests.duplicate_count(&request()), 2);
        requests.remove(&request(), addr(1));
        assert_eq!(requests.duplicate_count(&request()), 1);
    }

    #[test]
    fn remove_peer_frees_blocks_with_no_other_asker() {
        let mut requests = ActiveRequests::new();
        let now = Instant::now();
        requests.insert(request(), addr(1), now);
        requests.insert(request(), addr(2), now);
        let freed = requests.remove_peer(addr(1));
        assert!(freed.is_empty(), "block still has another asker");
        let freed = requests.remove_peer(addr(2));
        assert_eq!(freed, vec![request()]);
    }

    #[test]
    fn expired_finds_stale_asks() {
        let mut requests = ActiveRequests::new();
        let old = Instant::now() - Duration::from_secs(60);
        requests.insert(request(), addr(1), old);
        let expired = requests.expired(Instant::now(), Duration::from_secs(30));
        assert_eq!(expired, vec![(request(), addr(1))]);
    }

    #[test]
    fn expired_ignores_fresh_asks() {
        let mut requests = ActiveRequests::new();
        requests.insert(request(), addr(1), Instant::now());
        let expired = requests.expired(Instant::now(), Duration::from_secs(30));
        assert!(expired.is_empty());
    }

    #[test]
    fn insert_same_peer_twice_returns_false_second_time() {
        let mut requests = ActiveRequests::new();
        let now = Instant::now();
        assert!(requests.insert(request(), addr(1), now));
        let later = now + Duration::from_secs(5);
        assert!(!requests.insert(request(), addr(1), later));
        assert_eq!(requests.duplicate_count(&request()), 1);
    }
}
