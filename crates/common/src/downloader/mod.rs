//! # Downloader
//!
//! Decides which missing chunk to ask for next and from whom.
//!
//! Local metas tell the downloader which chunks we need ([`MissingChunk`]);
//! remote bitfields tell it who owns them. Every call to
//! [`Downloader::maintain_requests`] expires stale requests and fills the free
//! download slots with byte-range requests, highest [`WeightedQueue`] priority
//! first, one new request per chunk per pass so that slots spread over the
//! most urgent chunks. Completed chunks are hash-checked by the
//! [`ChunkStore`] and announced as [`DownloadEvent::ChunkDownloaded`].
//!
//! Nothing here blocks or touches the network: requests are returned to the
//! caller to send.

mod missing;

pub use missing::{MissingChunk, PendingRequest};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bitfield::Bitfield;
use crate::config::EngineConfig;
use crate::content::{ChunkHash, ChunkInfo, Kind, MetaInfo, PathId, PathRevision};
use crate::protocol::{BlockRequest, PeerId};
use crate::queue::{WeightConstants, WeightedQueue};
use crate::store::{ChunkStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadEvent {
    ChunkDownloaded(ChunkHash),
    /// The peer now owns something we need
    Interested(PeerId),
    /// The peer no longer owns anything we need
    NotInterested(PeerId),
}

/// What a received block did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// No matching pending request; nothing changed
    Unsolicited,
    Partial,
    Completed,
    /// The chunk was complete but did not hash correctly; it restarts
    Corrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloaderConfig {
    pub download_slots: usize,
    pub block_size: u32,
    pub request_timeout: Duration,
}

impl From<&EngineConfig> for DownloaderConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            download_slots: config.download_slots,
            block_size: config.block_size,
            request_timeout: config.request_timeout,
        }
    }
}

#[derive(Debug)]
struct TrackedMeta {
    revision: u64,
    chunks: Vec<ChunkHash>,
}

#[derive(Debug)]
struct RemotePeer {
    choked: bool,
    /// Missing chunks this peer owns
    wanted: usize,
}

#[derive(Debug)]
pub struct Downloader {
    config: DownloaderConfig,
    store: Arc<ChunkStore>,
    queue: WeightedQueue,
    missing: HashMap<ChunkHash, MissingChunk>,
    metas: HashMap<PathId, TrackedMeta>,
    chunk_refs: HashMap<ChunkHash, HashSet<PathId>>,
    peers: HashMap<PeerId, RemotePeer>,
    /// Bitfields peers announced, kept so they apply once we track the revision
    remote_bitfields: HashMap<PathRevision, HashMap<PeerId, Bitfield>>,
    events: flume::Sender<DownloadEvent>,
}

impl Downloader {
    pub fn new(
        config: DownloaderConfig,
        weights: WeightConstants,
        store: Arc<ChunkStore>,
    ) -> (Self, flume::Receiver<DownloadEvent>) {
        let (events, rx) = flume::unbounded();
        let downloader = Self {
            config,
            store,
            queue: WeightedQueue::new(weights),
            missing: HashMap::new(),
            metas: HashMap::new(),
            chunk_refs: HashMap::new(),
            peers: HashMap::new(),
            remote_bitfields: HashMap::new(),
            events,
        };
        (downloader, rx)
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }

    /* Local state */

    /// Track the chunks of a local meta; bit `i` of `local` set means chunk
    /// `i` is already present
    pub fn notify_local_meta(&mut self, meta: &MetaInfo, local: &Bitfield) {
        let path_id = meta.path_id;
        if self
            .metas
            .get(&path_id)
            .is_some_and(|t| t.revision > meta.revision)
        {
            return;
        }
        self.untrack(&path_id);
        self.remote_bitfields
            .retain(|rev, _| rev.path_id != path_id || rev.revision >= meta.revision);

        if meta.kind != Kind::File || meta.chunks.is_empty() {
            return;
        }

        let chunks: Vec<ChunkHash> = meta.chunks.iter().map(|c| c.ct_hash).collect();
        for hash in &chunks {
            self.chunk_refs.entry(*hash).or_default().insert(path_id);
        }
        self.metas.insert(
            path_id,
            TrackedMeta {
                revision: meta.revision,
                chunks: chunks.clone(),
            },
        );

        let mut any_present = false;
        let mut absent: Vec<&ChunkInfo> = Vec::new();
        for (i, info) in meta.chunks.iter().enumerate() {
            if local.get(i) {
                any_present = true;
                self.drop_missing(&info.ct_hash);
            } else {
                absent.push(info);
            }
        }
        for info in &absent {
            if !self.missing.contains_key(&info.ct_hash) {
                self.missing.insert(
                    info.ct_hash,
                    MissingChunk::new(info.ct_hash, info.padded_size()),
                );
                self.queue.add(info.ct_hash);
            }
        }
        if any_present {
            for info in &absent {
                self.queue.mark_clustered(&info.ct_hash);
            }
        }
        tracing::debug!(
            "tracking {:?} revision {}: {} of {} chunks missing",
            path_id,
            meta.revision,
            absent.len(),
            chunks.len()
        );

        if let Some(remotes) = self.remote_bitfields.get(&meta.path_revision()).cloned() {
            for (peer, bitfield) in remotes {
                self.apply_bitfield(&peer, &chunks, &bitfield);
            }
        }
    }

    /// Stop tracking a path, e.g. once it is assembled
    pub fn forget_meta(&mut self, path_id: &PathId) {
        self.untrack(path_id);
        self.remote_bitfields.retain(|rev, _| rev.path_id != *path_id);
    }

    fn untrack(&mut self, path_id: &PathId) {
        let Some(tracked) = self.metas.remove(path_id) else {
            return;
        };
        for hash in tracked.chunks {
            let unreferenced = match self.chunk_refs.get_mut(&hash) {
                Some(paths) => {
                    paths.remove(path_id);
                    paths.is_empty()
                }
                None => true,
            };
            if unreferenced {
                self.chunk_refs.remove(&hash);
                self.drop_missing(&hash);
            }
        }
    }

    fn drop_missing(&mut self, ct_hash: &ChunkHash) {
        let Some(chunk) = self.missing.remove(ct_hash) else {
            return;
        };
        self.queue.remove(ct_hash);
        for owner in &chunk.owners {
            self.release_interest(owner);
        }
    }

    fn release_interest(&mut self, peer: &PeerId) {
        let Some(state) = self.peers.get_mut(peer) else {
            return;
        };
        state.wanted = state.wanted.saturating_sub(1);
        if state.wanted == 0 {
            self.emit(DownloadEvent::NotInterested(*peer));
        }
    }

    pub fn mark_immediate(&mut self, ct_hash: &ChunkHash) -> bool {
        self.queue.mark_immediate(ct_hash)
    }

    /* Remote state */

    pub fn add_remote(&mut self, peer: PeerId) {
        self.peers.entry(peer).or_insert(RemotePeer {
            choked: true,
            wanted: 0,
        });
        self.queue.set_global_peer_count(self.peers.len() as u32);
    }

    pub fn remove_remote(&mut self, peer: &PeerId) {
        if self.peers.remove(peer).is_none() {
            return;
        }
        for (hash, chunk) in self.missing.iter_mut() {
            chunk.in_flight.remove(peer);
            if chunk.owners.remove(peer) {
                self.queue
                    .set_chunk_owner_count(hash, chunk.owners.len() as u32);
            }
        }
        self.remote_bitfields.retain(|_, peers| {
            peers.remove(peer);
            !peers.is_empty()
        });
        self.queue.set_global_peer_count(self.peers.len() as u32);
    }

    pub fn handle_choke(&mut self, peer: &PeerId) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.choked = true;
        }
        // a choking peer drops what we asked for
        for chunk in self.missing.values_mut() {
            chunk.in_flight.remove(peer);
        }
    }

    pub fn handle_unchoke(&mut self, peer: &PeerId) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.choked = false;
        }
    }

    /// A peer announced which chunks of `revision` it owns
    ///
    /// Chunks we do not track are ignored. The bitfield is remembered until we
    /// track that exact revision.
    pub fn notify_remote_meta(&mut self, peer: &PeerId, revision: &PathRevision, bitfield: &Bitfield) {
        // entries without chunks have nothing to download
        if !self.peers.contains_key(peer) || bitfield.is_empty() {
            return;
        }
        if self
            .metas
            .get(&revision.path_id)
            .is_some_and(|t| t.revision > revision.revision)
        {
            return;
        }
        self.remote_bitfields
            .entry(*revision)
            .or_default()
            .insert(*peer, bitfield.clone());

        let chunks = match self.metas.get(&revision.path_id) {
            Some(tracked) if tracked.revision == revision.revision => tracked.chunks.clone(),
            _ => return,
        };
        self.apply_bitfield(peer, &chunks, bitfield);
    }

    pub fn notify_remote_chunk(&mut self, peer: &PeerId, ct_hash: &ChunkHash) {
        self.add_owner(peer, ct_hash);
    }

    fn apply_bitfield(&mut self, peer: &PeerId, chunks: &[ChunkHash], bitfield: &Bitfield) {
        for (i, hash) in chunks.iter().enumerate() {
            if bitfield.get(i) {
                self.add_owner(peer, hash);
            }
        }
    }

    fn add_owner(&mut self, peer: &PeerId, ct_hash: &ChunkHash) {
        let Some(state) = self.peers.get_mut(peer) else {
            return;
        };
        let Some(chunk) = self.missing.get_mut(ct_hash) else {
            return;
        };
        if !chunk.owners.insert(*peer) {
            return;
        }
        self.queue
            .set_chunk_owner_count(ct_hash, chunk.owners.len() as u32);
        state.wanted += 1;
        if state.wanted == 1 {
            self.emit(DownloadEvent::Interested(*peer));
        }
    }

    /* Transfers */

    /// Accept a block a peer sent in response to one of our requests
    pub fn put_block(
        &mut self,
        peer: &PeerId,
        ct_hash: &ChunkHash,
        offset: u32,
        data: &[u8],
    ) -> Result<BlockOutcome, DownloadError> {
        let Some(chunk) = self.missing.get_mut(ct_hash) else {
            tracing::debug!("dropping block of untracked chunk {} from {}", ct_hash, peer);
            return Ok(BlockOutcome::Unsolicited);
        };
        if !chunk.fulfill(peer, offset, data.len() as u32) {
            tracing::debug!(
                "dropping unsolicited block {}@{}+{} from {}",
                ct_hash,
                offset,
                data.len(),
                peer
            );
            return Ok(BlockOutcome::Unsolicited);
        }
        chunk.write(offset, data);
        if !chunk.is_complete() {
            return Ok(BlockOutcome::Partial);
        }

        let ciphertext = chunk.take_data();
        match self.store.put_chunk(*ct_hash, ciphertext) {
            Ok(()) => {}
            Err(StoreError::HashMismatch(_)) => {
                tracing::warn!("chunk {} failed verification, downloading again", ct_hash);
                chunk.reset();
                return Ok(BlockOutcome::Corrupt);
            }
            Err(e) => {
                chunk.reset();
                return Err(e.into());
            }
        }

        self.complete(ct_hash);
        Ok(BlockOutcome::Completed)
    }

    fn complete(&mut self, ct_hash: &ChunkHash) {
        self.drop_missing(ct_hash);
        self.emit(DownloadEvent::ChunkDownloaded(*ct_hash));

        // files this chunk belongs to are now partially present
        let paths: Vec<PathId> = self
            .chunk_refs
            .get(ct_hash)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default();
        for path_id in paths {
            if let Some(tracked) = self.metas.get(&path_id) {
                for sibling in &tracked.chunks {
                    self.queue.mark_clustered(sibling);
                }
            }
        }
    }

    pub fn maintain_requests(&mut self) -> Vec<(PeerId, BlockRequest)> {
        self.maintain_requests_at(Instant::now())
    }

    /// Expire requests older than the timeout and fill free slots
    pub fn maintain_requests_at(&mut self, now: Instant) -> Vec<(PeerId, BlockRequest)> {
        for chunk in self.missing.values_mut() {
            for peer in chunk.expire(now, self.config.request_timeout) {
                tracing::debug!("request for {} to {} timed out", chunk.ct_hash(), peer);
            }
        }

        let mut load: HashMap<PeerId, usize> = HashMap::new();
        for chunk in self.missing.values() {
            for peer in chunk.in_flight.keys() {
                *load.entry(*peer).or_default() += 1;
            }
        }
        let mut in_flight: usize = load.values().sum();
        let mut requests = Vec::new();
        if in_flight >= self.config.download_slots {
            return requests;
        }

        let order = self.queue.ordered_ids();
        loop {
            let mut progressed = false;
            for hash in &order {
                if in_flight >= self.config.download_slots {
                    return requests;
                }
                let Some(chunk) = self.missing.get_mut(hash) else {
                    continue;
                };
                let peer = chunk
                    .owners
                    .iter()
                    .filter(|p| !chunk.in_flight.contains_key(*p))
                    .filter(|p| self.peers.get(*p).is_some_and(|s| !s.choked))
                    .min_by_key(|p| (load.get(*p).copied().unwrap_or(0), **p))
                    .copied();
                let Some(peer) = peer else {
                    continue;
                };
                let Some(range) = chunk.next_request(self.config.block_size) else {
                    continue;
                };

                let request = BlockRequest {
                    ct_hash: *hash,
                    offset: range.start,
                    length: range.end - range.start,
                };
                chunk.in_flight.insert(
                    peer,
                    PendingRequest {
                        offset: request.offset,
                        size: request.length,
                        started_at: now,
                    },
                );
                *load.entry(peer).or_default() += 1;
                in_flight += 1;
                progressed = true;
                requests.push((peer, request));
            }
            if !progressed {
                return requests;
            }
        }
    }

    /* Inspection */

    pub fn is_missing(&self, ct_hash: &ChunkHash) -> bool {
        self.missing.contains_key(ct_hash)
    }

    pub fn missing_chunk(&self, ct_hash: &ChunkHash) -> Option<&MissingChunk> {
        self.missing.get(ct_hash)
    }

    pub fn missing_count(&self) -> usize {
        self.missing.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.missing.values().map(|c| c.in_flight.len()).sum()
    }

    pub fn queue(&self) -> &WeightedQueue {
        &self.queue
    }

    /// Whether the peer owns any chunk we still need
    pub fn wants_from(&self, peer: &PeerId) -> bool {
        self.peers.get(peer).is_some_and(|s| s.wanted > 0)
    }

    /// Revisions we hold remote bitfields for
    pub fn remembered_revisions(&self) -> Vec<PathRevision> {
        self.remote_bitfields.keys().copied().collect()
    }

    pub fn is_tracking(&self, revision: &PathRevision) -> bool {
        self.metas
            .get(&revision.path_id)
            .is_some_and(|t| t.revision == revision.revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunker::ChunkerConfig;
    use crate::content::EncryptedData;
    use crate::crypto::{generate_iv, ContentKeys, FolderSecret, SecretKey};
    use bytes::Bytes;
    use range_collections::RangeSet2;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        keys: ContentKeys,
        store: Arc<ChunkStore>,
        downloader: Downloader,
        events: flume::Receiver<DownloadEvent>,
    }

    fn fixture(download_slots: usize, block_size: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let keys = FolderSecret::generate().unwrap().content_keys().unwrap();
        let (store, _) = ChunkStore::open(dir.path(), 1 << 20, None).unwrap();
        let store = Arc::new(store);
        let (downloader, events) = Downloader::new(
            DownloaderConfig {
                download_slots,
                block_size,
                request_timeout: Duration::from_secs(10),
            },
            WeightConstants::default(),
            store.clone(),
        );
        Fixture {
            _dir: dir,
            keys,
            store,
            downloader,
            events,
        }
    }

    fn peer() -> PeerId {
        SecretKey::generate().unwrap().public()
    }

    /// A file meta whose chunks are `parts`, plus each chunk's ciphertext
    fn file_meta(keys: &ContentKeys, id: u8, revision: u64, parts: &[&[u8]]) -> (MetaInfo, Vec<Vec<u8>>) {
        let mut chunks = Vec::new();
        let mut ciphertexts = Vec::new();
        for part in parts {
            let (info, ct) = ChunkInfo::seal(part, keys, generate_iv().unwrap()).unwrap();
            chunks.push(info);
            ciphertexts.push(ct);
        }
        let meta = MetaInfo {
            path_id: PathId::from_bytes([id; 32]),
            revision,
            kind: Kind::File,
            path: EncryptedData::seal(&[id], &keys.path).unwrap(),
            symlink_target: None,
            mtime: 0,
            mtime_granularity: 1,
            unix: None,
            chunking: Some(ChunkerConfig::default()),
            chunks,
        };
        (meta, ciphertexts)
    }

    fn drain(events: &flume::Receiver<DownloadEvent>) -> Vec<DownloadEvent> {
        events.try_iter().collect()
    }

    #[test]
    fn test_partially_present_file_is_clustered() {
        let mut fx = fixture(4, 1024);
        let (meta, _) = file_meta(&fx.keys, 1, 1, &[b"zero", b"one", b"two"]);

        fx.downloader
            .notify_local_meta(&meta, &Bitfield::from(vec![true, false, true]));

        assert_eq!(fx.downloader.missing_count(), 1);
        let missing = meta.chunks[1].ct_hash;
        assert!(fx.downloader.is_missing(&missing));
        assert!(fx.downloader.queue().weight(&missing).unwrap().clustered);
        assert_eq!(
            fx.downloader.missing_chunk(&missing).unwrap().padded_size(),
            meta.chunks[1].padded_size()
        );
    }

    #[test]
    fn test_slots_go_to_highest_weight_chunks() {
        let mut fx = fixture(2, 1024);
        let (meta, _) = file_meta(&fx.keys, 1, 1, &[b"a", b"b", b"c", b"d", b"e"]);
        fx.downloader.notify_local_meta(&meta, &Bitfield::new(5));

        let peer = peer();
        fx.downloader.add_remote(peer);
        fx.downloader.handle_unchoke(&peer);
        fx.downloader
            .notify_remote_meta(&peer, &meta.path_revision(), &Bitfield::full(5));
        let urgent = [meta.chunks[3].ct_hash, meta.chunks[1].ct_hash];
        for hash in &urgent {
            fx.downloader.mark_immediate(hash);
        }

        let requests = fx.downloader.maintain_requests();
        assert_eq!(requests.len(), 2);
        let mut requested: Vec<ChunkHash> = requests.iter().map(|(_, r)| r.ct_hash).collect();
        requested.sort();
        let mut expected = urgent.to_vec();
        expected.sort();
        assert_eq!(requested, expected);
        assert!(requests.iter().all(|(p, r)| *p == peer && r.offset == 0));

        // all slots busy
        assert!(fx.downloader.maintain_requests().is_empty());
        assert_eq!(fx.downloader.in_flight_count(), 2);
    }

    #[test]
    fn test_unsolicited_block_is_ignored() {
        let mut fx = fixture(4, 8);
        let (meta, ciphertexts) = file_meta(&fx.keys, 1, 1, &[b"0123456789abcdef"]);
        let hash = meta.chunks[0].ct_hash;
        fx.downloader.notify_local_meta(&meta, &Bitfield::new(1));

        let owner = peer();
        let stranger = peer();
        fx.downloader.add_remote(owner);
        fx.downloader.add_remote(stranger);
        fx.downloader.handle_unchoke(&owner);
        fx.downloader.notify_remote_chunk(&owner, &hash);
        let requests = fx.downloader.maintain_requests();
        assert_eq!(requests.len(), 1);
        let (_, request) = requests[0];
        let block = &ciphertexts[0][..request.length as usize];

        let before = fx.downloader.missing_chunk(&hash).unwrap().received().clone();
        for (from, offset, data) in [
            (&stranger, 0, block),
            (&owner, 1, block),
            (&owner, 0, &block[..4]),
        ] {
            assert_eq!(
                fx.downloader.put_block(from, &hash, offset, data).unwrap(),
                BlockOutcome::Unsolicited
            );
        }
        assert_eq!(
            fx.downloader.put_block(&owner, &ChunkHash::of(b"?"), 0, block).unwrap(),
            BlockOutcome::Unsolicited
        );
        let chunk = fx.downloader.missing_chunk(&hash).unwrap();
        assert_eq!(chunk.received(), &before);
        assert_eq!(chunk.in_flight.len(), 1);
    }

    #[test]
    fn test_full_download_over_two_peers() {
        let mut fx = fixture(8, 10);
        let plaintext = [7u8; 40];
        let (meta, ciphertexts) = file_meta(&fx.keys, 1, 1, &[&plaintext]);
        let hash = meta.chunks[0].ct_hash;
        let ciphertext = &ciphertexts[0];
        fx.downloader.notify_local_meta(&meta, &Bitfield::new(1));

        let (a, b) = (peer(), peer());
        for p in [a, b] {
            fx.downloader.add_remote(p);
            fx.downloader.handle_unchoke(&p);
            fx.downloader.notify_remote_chunk(&p, &hash);
        }
        assert_eq!(
            drain(&fx.events),
            vec![DownloadEvent::Interested(a), DownloadEvent::Interested(b)]
        );

        let mut completed = false;
        for _ in 0..20 {
            let requests = fx.downloader.maintain_requests();
            // requests in flight at the same time never overlap
            let mut covered = RangeSet2::<u32>::empty();
            for (_, r) in &requests {
                let range = RangeSet2::from(r.offset..r.offset + r.length);
                assert!(covered.is_disjoint(&range));
                covered.union_with(&range);
            }
            for (p, r) in requests {
                let data = &ciphertext[r.offset as usize..(r.offset + r.length) as usize];
                if fx.downloader.put_block(&p, &hash, r.offset, data).unwrap() == BlockOutcome::Completed {
                    completed = true;
                }
            }
            if completed {
                break;
            }
        }

        assert!(completed);
        assert!(!fx.downloader.is_missing(&hash));
        assert_eq!(fx.store.get_chunk(&hash).unwrap(), Bytes::from(ciphertext.clone()));
        let events = drain(&fx.events);
        assert!(events.contains(&DownloadEvent::ChunkDownloaded(hash)));
        assert!(events.contains(&DownloadEvent::NotInterested(a)));
        assert!(events.contains(&DownloadEvent::NotInterested(b)));
    }

    #[test]
    fn test_corrupt_chunk_restarts() {
        let mut fx = fixture(1, 1024);
        let (meta, ciphertexts) = file_meta(&fx.keys, 1, 1, &[b"payload"]);
        let hash = meta.chunks[0].ct_hash;
        fx.downloader.notify_local_meta(&meta, &Bitfield::new(1));
        let p = peer();
        fx.downloader.add_remote(p);
        fx.downloader.handle_unchoke(&p);
        fx.downloader.notify_remote_chunk(&p, &hash);

        let (_, request) = fx.downloader.maintain_requests()[0];
        let mut bad = ciphertexts[0].clone();
        bad[0] ^= 1;
        assert_eq!(
            fx.downloader.put_block(&p, &hash, request.offset, &bad).unwrap(),
            BlockOutcome::Corrupt
        );
        assert!(fx.downloader.is_missing(&hash));
        assert!(fx.downloader.missing_chunk(&hash).unwrap().received().is_empty());
        assert!(!fx.store.have_chunk(&hash));
        assert_eq!(fx.downloader.maintain_requests().len(), 1);
    }

    #[test]
    fn test_timeouts_free_slots() {
        let mut fx = fixture(1, 1024);
        let (meta, _) = file_meta(&fx.keys, 1, 1, &[b"x", b"y"]);
        fx.downloader.notify_local_meta(&meta, &Bitfield::new(2));
        let p = peer();
        fx.downloader.add_remote(p);
        fx.downloader.handle_unchoke(&p);
        fx.downloader
            .notify_remote_meta(&p, &meta.path_revision(), &Bitfield::full(2));

        let start = Instant::now();
        assert_eq!(fx.downloader.maintain_requests_at(start).len(), 1);
        assert!(fx
            .downloader
            .maintain_requests_at(start + Duration::from_secs(5))
            .is_empty());
        let retry = fx
            .downloader
            .maintain_requests_at(start + Duration::from_secs(10));
        assert_eq!(retry.len(), 1);
        assert_eq!(fx.downloader.in_flight_count(), 1);
    }

    #[test]
    fn test_choke_and_disconnect() {
        let mut fx = fixture(4, 1024);
        let (meta, _) = file_meta(&fx.keys, 1, 1, &[b"x"]);
        let hash = meta.chunks[0].ct_hash;
        fx.downloader.notify_local_meta(&meta, &Bitfield::new(1));
        let p = peer();
        fx.downloader.add_remote(p);
        fx.downloader.notify_remote_chunk(&p, &hash);
        assert!(fx.downloader.wants_from(&p));

        // choked by default
        assert!(fx.downloader.maintain_requests().is_empty());
        fx.downloader.handle_unchoke(&p);
        assert_eq!(fx.downloader.maintain_requests().len(), 1);
        fx.downloader.handle_choke(&p);
        assert_eq!(fx.downloader.in_flight_count(), 0);

        fx.downloader.handle_unchoke(&p);
        fx.downloader.maintain_requests();
        fx.downloader.remove_remote(&p);
        assert_eq!(fx.downloader.in_flight_count(), 0);
        assert_eq!(fx.downloader.queue().weight(&hash).unwrap().owners, 0);
        assert_eq!(fx.downloader.queue().weight(&hash).unwrap().peer_count, 0);
        assert!(!fx.downloader.wants_from(&p));
    }

    #[test]
    fn test_remote_bitfield_before_meta() {
        let mut fx = fixture(4, 1024);
        let (meta, _) = file_meta(&fx.keys, 1, 1, &[b"x", b"y"]);
        let p = peer();
        fx.downloader.add_remote(p);
        fx.downloader
            .notify_remote_meta(&p, &meta.path_revision(), &Bitfield::from(vec![false, true]));
        assert!(!fx.downloader.wants_from(&p));

        fx.downloader.notify_local_meta(&meta, &Bitfield::new(2));
        assert!(fx.downloader.wants_from(&p));
        assert_eq!(
            fx.downloader.queue().weight(&meta.chunks[1].ct_hash).unwrap().owners,
            1
        );
        assert_eq!(
            fx.downloader.queue().weight(&meta.chunks[0].ct_hash).unwrap().owners,
            0
        );
    }

    #[test]
    fn test_forget_meta_drops_remote_bitfields() {
        let mut fx = fixture(4, 1024);
        let (meta, _) = file_meta(&fx.keys, 1, 1, &[b"x", b"y"]);
        let (other, _) = file_meta(&fx.keys, 2, 1, &[b"z"]);
        let p = peer();
        fx.downloader.add_remote(p);
        fx.downloader.notify_local_meta(&meta, &Bitfield::new(2));
        fx.downloader
            .notify_remote_meta(&p, &meta.path_revision(), &Bitfield::full(2));
        fx.downloader
            .notify_remote_meta(&p, &other.path_revision(), &Bitfield::full(1));
        assert_eq!(fx.downloader.remembered_revisions().len(), 2);

        fx.downloader.forget_meta(&meta.path_id);
        assert_eq!(
            fx.downloader.remembered_revisions(),
            vec![other.path_revision()]
        );
        assert!(!fx.downloader.is_tracking(&meta.path_revision()));

        // nothing is remembered for entries without chunks
        let mut dir = other.clone();
        dir.path_id = PathId::from_bytes([9; 32]);
        fx.downloader
            .notify_remote_meta(&p, &dir.path_revision(), &Bitfield::new(0));
        assert_eq!(fx.downloader.remembered_revisions().len(), 1);
    }

    #[test]
    fn test_newer_revision_replaces_chunks() {
        let mut fx = fixture(4, 1024);
        let (old, _) = file_meta(&fx.keys, 1, 1, &[b"old"]);
        let (new, _) = file_meta(&fx.keys, 1, 2, &[b"new"]);
        fx.downloader.notify_local_meta(&old, &Bitfield::new(1));
        fx.downloader.notify_local_meta(&new, &Bitfield::new(1));

        assert!(!fx.downloader.is_missing(&old.chunks[0].ct_hash));
        assert!(fx.downloader.is_missing(&new.chunks[0].ct_hash));
        assert!(fx.downloader.is_tracking(&new.path_revision()));

        // older revisions arriving late are ignored
        fx.downloader.notify_local_meta(&old, &Bitfield::new(1));
        assert!(!fx.downloader.is_missing(&old.chunks[0].ct_hash));

        fx.downloader.forget_meta(&new.path_id);
        assert_eq!(fx.downloader.missing_count(), 0);
        assert!(fx.downloader.queue().is_empty());
    }
}
