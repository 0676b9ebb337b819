use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::time::{Duration, Instant};

use bytes::Bytes;
use range_collections::range_set::RangeSetRange;
use range_collections::RangeSet2;

use crate::content::ChunkHash;
use crate::protocol::PeerId;

/// A block request waiting for its response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub offset: u32,
    pub size: u32,
    pub started_at: Instant,
}

impl PendingRequest {
    pub fn range(&self) -> Range<u32> {
        self.offset..self.offset + self.size
    }
}

/// Download state of one chunk we need but do not have
#[derive(Debug)]
pub struct MissingChunk {
    ct_hash: ChunkHash,
    padded_size: u32,
    received: RangeSet2<u32>,
    buffer: Vec<u8>,
    /// At most one pending request per peer
    pub(super) in_flight: HashMap<PeerId, PendingRequest>,
    /// Connected peers known to hold the whole chunk
    pub(super) owners: HashSet<PeerId>,
}

impl MissingChunk {
    pub fn new(ct_hash: ChunkHash, padded_size: u32) -> Self {
        Self {
            ct_hash,
            padded_size,
            received: RangeSet2::empty(),
            buffer: Vec::new(),
            in_flight: HashMap::new(),
            owners: HashSet::new(),
        }
    }

    pub fn ct_hash(&self) -> &ChunkHash {
        &self.ct_hash
    }

    pub fn padded_size(&self) -> u32 {
        self.padded_size
    }

    pub fn received(&self) -> &RangeSet2<u32> {
        &self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received.is_superset(&RangeSet2::from(0..self.padded_size))
    }

    /// Next range worth asking for: the lowest bytes neither received nor
    /// already requested, capped at `block_size`
    pub fn next_request(&self, block_size: u32) -> Option<Range<u32>> {
        let mut open = RangeSet2::from(0..self.padded_size);
        open.difference_with(&self.received);
        for pending in self.in_flight.values() {
            open.difference_with(&RangeSet2::from(pending.range()));
        }
        let (start, end) = match open.iter().next()? {
            RangeSetRange::Range(r) => (*r.start, *r.end),
            RangeSetRange::RangeFrom(r) => (*r.start, self.padded_size),
        };
        Some(start..end.min(start.saturating_add(block_size.max(1))))
    }

    /// Take the request `peer` has pending if it matches exactly
    pub fn fulfill(&mut self, peer: &PeerId, offset: u32, size: u32) -> bool {
        match self.in_flight.get(peer) {
            Some(p) if p.offset == offset && p.size == size => {
                self.in_flight.remove(peer);
                true
            }
            _ => false,
        }
    }

    pub fn write(&mut self, offset: u32, data: &[u8]) {
        let end = offset as usize + data.len();
        if end > self.padded_size as usize {
            return;
        }
        if self.buffer.is_empty() {
            self.buffer = vec![0; self.padded_size as usize];
        }
        self.buffer[offset as usize..end].copy_from_slice(data);
        self.received.union_with(&RangeSet2::from(offset..end as u32));
    }

    /// Drop requests older than `timeout`, returning the peers they went to
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        let expired: Vec<PeerId> = self
            .in_flight
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.started_at) >= timeout)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &expired {
            self.in_flight.remove(peer);
        }
        expired
    }

    /// Forget everything received, after the assembled bytes proved corrupt
    pub fn reset(&mut self) {
        self.received = RangeSet2::empty();
        self.buffer = Vec::new();
    }

    pub fn take_data(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SecretKey;

    #[test]
    fn test_requests_never_overlap() {
        let peer_a = SecretKey::generate().unwrap().public();
        let peer_b = SecretKey::generate().unwrap().public();
        let now = Instant::now();
        let mut chunk = MissingChunk::new(ChunkHash::of(b"x"), 100);

        let first = chunk.next_request(40).unwrap();
        assert_eq!(first, 0..40);
        chunk.in_flight.insert(
            peer_a,
            PendingRequest {
                offset: 0,
                size: 40,
                started_at: now,
            },
        );
        let second = chunk.next_request(40).unwrap();
        assert_eq!(second, 40..80);
        chunk.in_flight.insert(
            peer_b,
            PendingRequest {
                offset: 40,
                size: 40,
                started_at: now,
            },
        );
        assert_eq!(chunk.next_request(40), Some(80..100));

        assert!(!chunk.fulfill(&peer_a, 0, 39));
        assert!(chunk.fulfill(&peer_a, 0, 40));
        chunk.write(0, &[7; 40]);
        assert!(!chunk.is_complete());
        assert_eq!(chunk.received(), &RangeSet2::from(0..40));
    }

    #[test]
    fn test_expire() {
        let peer = SecretKey::generate().unwrap().public();
        let start = Instant::now();
        let mut chunk = MissingChunk::new(ChunkHash::of(b"x"), 10);
        chunk.in_flight.insert(
            peer,
            PendingRequest {
                offset: 0,
                size: 10,
                started_at: start,
            },
        );
        assert!(chunk
            .expire(start + Duration::from_secs(1), Duration::from_secs(2))
            .is_empty());
        assert_eq!(
            chunk.expire(start + Duration::from_secs(2), Duration::from_secs(2)),
            vec![peer]
        );
        assert_eq!(chunk.next_request(64), Some(0..10));
    }
}
