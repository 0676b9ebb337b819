//! # Folder engine
//!
//! Wires the pieces of one synchronized folder together:
//!
//! - local changes go through the [`Scanner`] and are announced to peers
//! - remote metas are verified, indexed and handed to the [`Downloader`]
//! - the event loop sends block requests, reacts to completed chunks and
//!   schedules the [`Assembler`]
//! - peers that are interested in us get unchoked and served
//!
//! The connection layer is external. It calls [`FolderEngine::peer_connected`],
//! [`FolderEngine::peer_disconnected`] and [`FolderEngine::handle_message`],
//! and receives outbound messages through the [`Transport`] it handed in.
//! Scans and assemblies run on a bounded [`JobPool`]; everything else is
//! cheap and runs inline.

mod jobs;

pub use jobs::{JobKey, JobPool};

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use walkdir::WalkDir;

use crate::assembler::{AssembleError, AssembleOutcome, Assembler};
use crate::bitfield::Bitfield;
use crate::config::{EngineConfig, CHUNKS_DIR_NAME, SYSTEM_DIR_NAME};
use crate::content::{denormalize, ContentError, Kind, MetaInfo, PathId, PathRevision, SignedMeta};
use crate::crypto::FolderSecret;
use crate::downloader::{BlockOutcome, DownloadError, DownloadEvent, Downloader, DownloaderConfig};
use crate::index::{Index, IndexError};
use crate::protocol::{BlockRequest, BlockResponse, Handshake, Message, PeerId, Transport, USER_AGENT};
use crate::scanner::{ScanError, ScanOutcome, Scanner};
use crate::store::{ChunkStore, OpenStorage, StoreError, StoreEvent};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("scan error: {0}")]
    Scan(#[from] ScanError),
    #[error("assemble error: {0}")]
    Assemble(#[from] AssembleError),
    #[error("index error: {0}")]
    Index(#[from] IndexError),
    #[error("download error: {0}")]
    Download(#[from] DownloadError),
    #[error("content error: {0}")]
    Content(#[from] ContentError),
    #[error("folder secret cannot sign")]
    NotWritable,
    #[error("unhandled engine error: {0}")]
    Default(#[from] anyhow::Error),
}

/// What we know about a connected peer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PeerState {
    /// Its handshake carried a valid token
    pub authenticated: bool,
    /// We serve its block requests
    pub unchoked: bool,
    /// It told us it wants chunks we own
    pub interested: bool,
}

#[derive(Clone)]
pub struct FolderEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    root: PathBuf,
    folder: FolderSecret,
    device: PeerId,
    config: EngineConfig,
    index: Arc<dyn Index>,
    transport: Arc<dyn Transport>,
    store: Arc<ChunkStore>,
    scanner: Option<Scanner>,
    assembler: Assembler,
    downloader: Mutex<Downloader>,
    peers: Mutex<HashMap<PeerId, PeerState>>,
    jobs: JobPool,
    store_events: flume::Receiver<StoreEvent>,
    download_events: flume::Receiver<DownloadEvent>,
}

impl std::fmt::Debug for FolderEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderEngine")
            .field("root", &self.inner.root)
            .field("device", &self.inner.device)
            .field("level", &self.inner.folder.level())
            .finish()
    }
}

impl FolderEngine {
    /// Set up the engine for the folder at `root`
    ///
    /// `device` is this device's key as peers see it. Metas the index holds
    /// but that are not assembled yet are picked up for download right away.
    pub fn new(
        root: impl Into<PathBuf>,
        folder: FolderSecret,
        device: PeerId,
        config: EngineConfig,
        index: Arc<dyn Index>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, EngineError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(StoreError::from)?;

        let derived = match (folder.can_sign(), folder.content_keys()) {
            (true, Some(keys)) => Some(OpenStorage::new(&root, keys, index.clone())),
            _ => None,
        };
        let (store, store_events) = ChunkStore::open(
            root.join(SYSTEM_DIR_NAME).join(CHUNKS_DIR_NAME),
            config.cache_bytes,
            derived,
        )?;
        let store = Arc::new(store);

        let scanner = if folder.can_sign() {
            Some(Scanner::new(&root, &folder, index.clone(), config.chunker)?)
        } else {
            None
        };
        let assembler = Assembler::new(
            &root,
            &folder,
            index.clone(),
            store.clone(),
            config.archive.clone(),
        )?;
        let (mut downloader, download_events) = Downloader::new(
            DownloaderConfig::from(&config),
            config.weights,
            store.clone(),
        );
        for indexed in index.unassembled()? {
            let meta = indexed.meta();
            downloader.notify_local_meta(meta, &local_bitfield(&store, meta));
        }

        tracing::info!(
            "opened folder {} as {:?} ({:?} access)",
            root.display(),
            device,
            folder.level()
        );
        Ok(Self {
            inner: Arc::new(EngineInner {
                jobs: JobPool::new(config.worker_threads),
                root,
                folder,
                device,
                config,
                index,
                transport,
                store,
                scanner,
                assembler,
                downloader: Mutex::new(downloader),
                peers: Mutex::new(HashMap::new()),
                store_events,
                download_events,
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn index(&self) -> &Arc<dyn Index> {
        &self.inner.index
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.inner.store
    }

    pub fn jobs(&self) -> &JobPool {
        &self.inner.jobs
    }

    pub fn peer(&self, peer: &PeerId) -> Option<PeerState> {
        self.inner.peers.lock().get(peer).copied()
    }

    /// Run `f` against the downloader, for inspection
    pub fn with_downloader<R>(&self, f: impl FnOnce(&Downloader) -> R) -> R {
        f(&self.inner.downloader.lock())
    }

    /* Event loop */

    /// Drive downloads, assembly and maintenance until `shutdown` fires
    ///
    /// Running jobs are interrupted and awaited before this returns.
    pub async fn run(&self, mut shutdown: watch::Receiver<()>) {
        let inner = &self.inner;
        let mut maintain = tokio::time::interval(inner.config.maintain_interval);
        maintain.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sweep = tokio::time::interval(inner.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = maintain.tick() => self.maintain(),
                _ = sweep.tick() => self.sweep(),
                Ok(event) = inner.store_events.recv_async() => self.handle_store_event(event),
                Ok(event) = inner.download_events.recv_async() => self.handle_download_event(event),
            }
        }

        tracing::info!("shutting down folder {}", inner.root.display());
        inner.jobs.shutdown().await;
    }

    /// Send whatever block requests the downloader wants out now
    pub fn maintain(&self) {
        let requests = self.inner.downloader.lock().maintain_requests();
        for (peer, request) in requests {
            tracing::debug!("requesting {:?} from {:?}", request, peer);
            self.inner.transport.send(&peer, Message::BlockRequest(request));
        }
    }

    /// Retry pending assemblies and prune the archive
    pub fn sweep(&self) {
        match self.inner.assembler.pending() {
            Ok(pending) => {
                for path_id in pending {
                    self.assemble_path(path_id);
                }
            }
            Err(e) => tracing::warn!("failed to list pending assemblies: {}", e),
        }

        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = inner.assembler.archive().maintain() {
                tracing::warn!("archive maintenance failed: {}", e);
            }
        });
    }

    fn handle_store_event(&self, event: StoreEvent) {
        let StoreEvent::ChunkAdded(ct_hash) = event;
        match self.inner.index.containing_chunk(&ct_hash) {
            Ok(metas) => {
                for indexed in metas.into_iter().filter(|m| !m.assembled) {
                    self.assemble_path(indexed.meta().path_id);
                }
            }
            Err(e) => tracing::warn!("failed to look up metas of chunk {}: {}", ct_hash, e),
        }
    }

    fn handle_download_event(&self, event: DownloadEvent) {
        match event {
            DownloadEvent::ChunkDownloaded(ct_hash) => {
                // peers can now fetch this chunk from us too
                match self.inner.index.containing_chunk(&ct_hash) {
                    Ok(metas) => {
                        for indexed in &metas {
                            self.inner.broadcast_index_update(indexed.meta());
                        }
                    }
                    Err(e) => tracing::warn!("failed to look up metas of chunk {}: {}", ct_hash, e),
                }
            }
            DownloadEvent::Interested(peer) => self.inner.transport.send(&peer, Message::Interested),
            DownloadEvent::NotInterested(peer) => {
                self.inner.transport.send(&peer, Message::NotInterested)
            }
        }
    }

    /* Local work */

    /// Queue a scan of `path`; repeated calls while it runs coalesce
    pub fn scan_path(&self, path: impl Into<PathBuf>) -> Result<bool, EngineError> {
        if self.inner.scanner.is_none() {
            return Err(EngineError::NotWritable);
        }
        let path = path.into();
        let inner = self.inner.clone();
        let key = JobKey::Scan(path.clone());
        Ok(self
            .inner
            .jobs
            .submit(key, move |interrupt| inner.scan_now(&path, interrupt)))
    }

    /// Queue assembly of `path_id`; repeated calls while it runs coalesce
    pub fn assemble_path(&self, path_id: PathId) -> bool {
        let inner = self.inner.clone();
        self.inner
            .jobs
            .submit(JobKey::Assemble(path_id), move |interrupt| {
                inner.assemble_now(&path_id, interrupt)
            })
    }

    /// Scan every entry under the root, plus every indexed path that is gone
    ///
    /// Returns how many scans were queued.
    pub fn index_all(&self) -> Result<usize, EngineError> {
        let Some(scanner) = &self.inner.scanner else {
            return Err(EngineError::NotWritable);
        };
        let system_dir = self.inner.root.join(SYSTEM_DIR_NAME);
        let mut queued = 0;

        let walker = WalkDir::new(&self.inner.root)
            .min_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| e.path() != system_dir);
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("skipping unreadable entry: {}", e);
                    continue;
                }
            };
            self.scan_path(entry.into_path())?;
            queued += 1;
        }

        let Some(keys) = self.inner.folder.content_keys() else {
            return Ok(queued);
        };
        for indexed in self.inner.index.all_metas()? {
            let meta = indexed.meta();
            if !indexed.assembled || meta.kind == Kind::Deleted {
                continue;
            }
            let relative = meta.decrypt_path(&keys.path)?;
            let path = denormalize(scanner.root(), &relative)?;
            if fs::symlink_metadata(&path).is_err() {
                self.scan_path(path)?;
                queued += 1;
            }
        }
        tracing::debug!("queued {} scans", queued);
        Ok(queued)
    }

    /// Wait until no scan or assembly is queued or running
    pub async fn wait_idle(&self) {
        self.inner.jobs.wait_idle().await
    }

    /* Network callbacks */

    /// A connection to `peer` is up; introduce ourselves
    pub fn peer_connected(&self, peer: PeerId) {
        self.inner.peers.lock().entry(peer).or_default();
        let handshake = Handshake {
            auth_token: self.inner.folder.auth_token(&peer),
            device_name: self.inner.config.device_name.clone(),
            user_agent: USER_AGENT.to_string(),
        };
        self.inner.transport.send(&peer, Message::Handshake(handshake));
    }

    pub fn peer_disconnected(&self, peer: &PeerId) {
        if self.inner.peers.lock().remove(peer).is_some() {
            tracing::debug!("peer {:?} disconnected", peer);
        }
        self.inner.downloader.lock().remove_remote(peer);
    }

    /// Handle one message from `peer`
    ///
    /// Problems are logged and the message dropped; nothing here fails the
    /// connection. Must be called from within a tokio runtime.
    pub fn handle_message(&self, peer: &PeerId, message: Message) {
        let name = message.name();
        if let Err(e) = self.dispatch(peer, message) {
            tracing::warn!("dropping {} from {:?}: {}", name, peer, e);
        }
    }

    fn dispatch(&self, peer: &PeerId, message: Message) -> Result<(), EngineError> {
        let inner = &self.inner;
        if let Message::Handshake(handshake) = message {
            return inner.handle_handshake(peer, handshake);
        }
        if !inner.peer_state(peer).authenticated {
            tracing::debug!("ignoring {} from unauthenticated {:?}", message.name(), peer);
            return Ok(());
        }

        match message {
            Message::Handshake(_) => Ok(()),
            Message::Choke => {
                inner.downloader.lock().handle_choke(peer);
                Ok(())
            }
            Message::Unchoke => {
                inner.downloader.lock().handle_unchoke(peer);
                Ok(())
            }
            Message::Interested => {
                let unchoke = inner.update_peer(peer, |state| {
                    state.interested = true;
                    !std::mem::replace(&mut state.unchoked, true)
                });
                if unchoke {
                    inner.transport.send(peer, Message::Unchoke);
                }
                Ok(())
            }
            Message::NotInterested => {
                let choke = inner.update_peer(peer, |state| {
                    state.interested = false;
                    std::mem::replace(&mut state.unchoked, false)
                });
                if choke {
                    inner.transport.send(peer, Message::Choke);
                }
                Ok(())
            }
            Message::IndexUpdate { revision, bitfield } => {
                inner.handle_index_update(peer, revision, bitfield)
            }
            Message::MetaRequest { revision } => inner.handle_meta_request(peer, revision),
            Message::MetaResponse { meta, bitfield } => {
                let signed = match SignedMeta::verify(meta, &inner.folder) {
                    Ok(signed) => signed,
                    Err(e) => {
                        tracing::warn!("discarding meta from {:?}: {}", peer, e);
                        return Ok(());
                    }
                };
                if let Err(e) = signed.meta().validate() {
                    tracing::warn!("discarding malformed meta from {:?}: {}", peer, e);
                    return Ok(());
                }
                if let Some(path_id) = inner.accept_meta(peer, signed, &bitfield)? {
                    self.assemble_path(path_id);
                }
                Ok(())
            }
            Message::BlockRequest(request) => {
                if !inner.peer_state(peer).unchoked {
                    tracing::debug!("ignoring block request from choked {:?}", peer);
                    return Ok(());
                }
                let inner = self.inner.clone();
                let peer = *peer;
                tokio::task::spawn_blocking(move || inner.serve_block(&peer, request));
                Ok(())
            }
            Message::BlockResponse(response) => {
                let outcome = inner.downloader.lock().put_block(
                    peer,
                    &response.ct_hash,
                    response.offset,
                    &response.content,
                );
                if outcome? == BlockOutcome::Corrupt {
                    tracing::warn!("chunk {} from {:?} was corrupt", response.ct_hash, peer);
                }
                Ok(())
            }
        }
    }
}

impl EngineInner {
    fn peer_state(&self, peer: &PeerId) -> PeerState {
        self.peers.lock().get(peer).copied().unwrap_or_default()
    }

    fn update_peer<R: Default>(&self, peer: &PeerId, f: impl FnOnce(&mut PeerState) -> R) -> R {
        self.peers.lock().get_mut(peer).map(f).unwrap_or_default()
    }

    fn authenticated_peers(&self) -> Vec<PeerId> {
        self.peers
            .lock()
            .iter()
            .filter(|(_, s)| s.authenticated)
            .map(|(p, _)| *p)
            .collect()
    }

    fn handle_handshake(&self, peer: &PeerId, handshake: Handshake) -> Result<(), EngineError> {
        if handshake.auth_token != self.folder.auth_token(&self.device) {
            tracing::warn!(
                "rejecting handshake from {:?} ({}): bad auth token",
                peer,
                handshake.device_name
            );
            return Ok(());
        }
        let newly = {
            let mut peers = self.peers.lock();
            let state = peers.entry(*peer).or_default();
            !std::mem::replace(&mut state.authenticated, true)
        };
        if !newly {
            return Ok(());
        }
        tracing::info!(
            "peer {:?} joined as {} ({})",
            peer,
            handshake.device_name,
            handshake.user_agent
        );
        self.downloader.lock().add_remote(*peer);

        for indexed in self.index.all_metas()? {
            self.send_index_update(peer, indexed.meta());
        }
        Ok(())
    }

    fn handle_index_update(
        &self,
        peer: &PeerId,
        revision: PathRevision,
        bitfield: Bitfield,
    ) -> Result<(), EngineError> {
        match self.index.get_meta(&revision.path_id)? {
            Some(current) if current.meta().revision > revision.revision => {}
            Some(current) if current.meta().revision == revision.revision => {
                if !current.assembled {
                    self.downloader
                        .lock()
                        .notify_remote_meta(peer, &revision, &bitfield);
                }
            }
            _ => {
                // newer or unknown: remember who has what, then fetch the meta
                self.downloader
                    .lock()
                    .notify_remote_meta(peer, &revision, &bitfield);
                self.transport.send(peer, Message::MetaRequest { revision });
            }
        }
        Ok(())
    }

    fn handle_meta_request(&self, peer: &PeerId, revision: PathRevision) -> Result<(), EngineError> {
        match self.index.get_meta(&revision.path_id)? {
            Some(current) if current.meta().revision >= revision.revision => {
                let bitfield = local_bitfield(&self.store, current.meta());
                self.transport.send(
                    peer,
                    Message::MetaResponse {
                        meta: current.signed.to_wire(),
                        bitfield,
                    },
                );
            }
            _ => tracing::debug!("{:?} asked for unknown revision {:?}", peer, revision),
        }
        Ok(())
    }

    /// Index a verified remote meta; returns the path to assemble if it is new
    fn accept_meta(
        &self,
        peer: &PeerId,
        signed: SignedMeta,
        bitfield: &Bitfield,
    ) -> Result<Option<PathId>, EngineError> {
        let revision = signed.path_revision();
        let meta = signed.meta().clone();
        if !self.index.put_meta(signed, false)? {
            tracing::debug!("already have {:?} or newer", revision);
            if self
                .index
                .get_meta_at(&revision)?
                .is_some_and(|m| !m.assembled)
            {
                self.downloader
                    .lock()
                    .notify_remote_meta(peer, &revision, bitfield);
            }
            return Ok(None);
        }

        tracing::debug!("indexed {:?} ({:?}) from {:?}", revision, meta.kind, peer);
        {
            let mut downloader = self.downloader.lock();
            if meta.kind == Kind::File {
                downloader.notify_local_meta(&meta, &local_bitfield(&self.store, &meta));
            } else {
                downloader.forget_meta(&meta.path_id);
            }
            downloader.notify_remote_meta(peer, &revision, bitfield);
        }
        self.broadcast_index_update(&meta);
        Ok(Some(meta.path_id))
    }

    fn serve_block(&self, peer: &PeerId, request: BlockRequest) {
        let data = match self.store.get_chunk(&request.ct_hash) {
            Ok(data) => data,
            Err(StoreError::NoSuchChunk(_)) => {
                tracing::debug!("{:?} asked for chunk {} we lack", peer, request.ct_hash);
                return;
            }
            Err(e) => {
                tracing::warn!("failed to read chunk {}: {}", request.ct_hash, e);
                return;
            }
        };
        let start = request.offset as usize;
        let end = start.saturating_add(request.length as usize);
        if request.length == 0 || end > data.len() {
            tracing::warn!(
                "{:?} asked for {}..{} of {}-byte chunk {}",
                peer,
                start,
                end,
                data.len(),
                request.ct_hash
            );
            return;
        }
        self.transport.send(
            peer,
            Message::BlockResponse(BlockResponse {
                ct_hash: request.ct_hash,
                offset: request.offset,
                content: data[start..end].to_vec(),
            }),
        );
    }

    fn send_index_update(&self, peer: &PeerId, meta: &MetaInfo) {
        self.transport.send(
            peer,
            Message::IndexUpdate {
                revision: meta.path_revision(),
                bitfield: local_bitfield(&self.store, meta),
            },
        );
    }

    fn broadcast_index_update(&self, meta: &MetaInfo) {
        for peer in self.authenticated_peers() {
            self.send_index_update(&peer, meta);
        }
    }

    fn scan_now(&self, path: &Path, interrupt: &AtomicBool) -> anyhow::Result<()> {
        let Some(scanner) = &self.scanner else {
            return Ok(());
        };
        match scanner.scan(path, interrupt) {
            Ok(ScanOutcome::Indexed(signed)) => {
                let meta = signed.meta();
                // a local revision supersedes whatever we were fetching
                self.downloader.lock().forget_meta(&meta.path_id);
                self.broadcast_index_update(meta);
                Ok(())
            }
            Ok(ScanOutcome::Unchanged) => Ok(()),
            Err(ScanError::Skip(reason)) => {
                tracing::debug!("skipped {}: {}", path.display(), reason);
                Ok(())
            }
            Err(ScanError::Interrupted) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn assemble_now(&self, path_id: &PathId, interrupt: &AtomicBool) -> anyhow::Result<()> {
        match self.assembler.assemble(path_id, interrupt) {
            Ok(AssembleOutcome::Assembled) => {
                self.downloader.lock().forget_meta(path_id);
                Ok(())
            }
            Ok(AssembleOutcome::NotReady(reason)) => {
                tracing::debug!("{:?} not ready: {}", path_id, reason);
                Ok(())
            }
            Err(AssembleError::Interrupted) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Bit `i` set when chunk `i` of `meta` is available locally
fn local_bitfield(store: &ChunkStore, meta: &MetaInfo) -> Bitfield {
    meta.chunks
        .iter()
        .map(|c| store.have_chunk(&c.ct_hash))
        .collect()
}
