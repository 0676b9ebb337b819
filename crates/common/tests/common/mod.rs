//! Shared test utilities for engine integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ::common::chunker::ChunkerConfig;
use ::common::config::EngineConfig;
use ::common::crypto::{FolderSecret, SecretKey};
use ::common::engine::FolderEngine;
use ::common::index::MemoryIndex;
use ::common::protocol::{Message, PeerId, Transport};
use parking_lot::{Mutex, RwLock};
use tempfile::TempDir;
use tokio::sync::watch;

type Envelope = (PeerId, PeerId, Message);

/// Transport that hands everything to the in-process router
#[derive(Debug)]
pub struct Wire {
    from: PeerId,
    outbox: flume::Sender<Envelope>,
}

impl Transport for Wire {
    fn send(&self, peer: &PeerId, message: Message) {
        let _ = self.outbox.send((self.from, *peer, message));
    }
}

/// Transport that only records what was sent
#[derive(Debug, Default)]
pub struct Recorder {
    pub sent: Mutex<Vec<(PeerId, Message)>>,
}

impl Transport for Recorder {
    fn send(&self, peer: &PeerId, message: Message) {
        self.sent.lock().push((*peer, message));
    }
}

impl Recorder {
    pub fn take(&self) -> Vec<(PeerId, Message)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

pub struct TestPeer {
    pub engine: FolderEngine,
    pub device: PeerId,
    pub index: Arc<MemoryIndex>,
    pub dir: TempDir,
}

impl TestPeer {
    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

/// Several engines wired together through an in-process router
///
/// Every message goes through the bincode codec on the way.
pub struct TestNet {
    engines: Arc<RwLock<HashMap<PeerId, FolderEngine>>>,
    outbox: flume::Sender<Envelope>,
    shutdown: watch::Sender<()>,
    shutdown_rx: watch::Receiver<()>,
}

impl TestNet {
    pub fn new() -> Self {
        init_tracing();
        let (outbox, inbox) = flume::unbounded::<Envelope>();
        let (shutdown, shutdown_rx) = watch::channel(());
        let engines: Arc<RwLock<HashMap<PeerId, FolderEngine>>> = Default::default();

        let routes = engines.clone();
        tokio::spawn(async move {
            while let Ok((from, to, message)) = inbox.recv_async().await {
                let bytes = message.encode().unwrap();
                let message = Message::decode(&bytes).unwrap();
                let engine = routes.read().get(&to).cloned();
                if let Some(engine) = engine {
                    engine.handle_message(&from, message);
                }
            }
        });

        Self {
            engines,
            outbox,
            shutdown,
            shutdown_rx,
        }
    }

    /// Start an engine for `folder` in a fresh directory
    pub fn spawn_peer(&self, folder: FolderSecret) -> TestPeer {
        let dir = TempDir::new().unwrap();
        let device = SecretKey::generate().unwrap().public();
        let index = Arc::new(MemoryIndex::new());
        let transport = Arc::new(Wire {
            from: device,
            outbox: self.outbox.clone(),
        });
        let engine = FolderEngine::new(
            dir.path(),
            folder,
            device,
            test_config(),
            index.clone(),
            transport,
        )
        .unwrap();

        self.engines.write().insert(device, engine.clone());
        let runner = engine.clone();
        let shutdown = self.shutdown_rx.clone();
        tokio::spawn(async move { runner.run(shutdown).await });

        TestPeer {
            engine,
            device,
            index,
            dir,
        }
    }

    pub fn connect(&self, a: &TestPeer, b: &TestPeer) {
        a.engine.peer_connected(b.device);
        b.engine.peer_connected(a.device);
    }

    pub fn disconnect(&self, a: &TestPeer, b: &TestPeer) {
        a.engine.peer_disconnected(&b.device);
        b.engine.peer_disconnected(&a.device);
    }
}

impl Drop for TestNet {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}

/// Small chunks and blocks so that modest files exercise multi-block transfers
pub fn test_config() -> EngineConfig {
    EngineConfig {
        block_size: 256,
        download_slots: 8,
        maintain_interval: Duration::from_millis(10),
        sweep_interval: Duration::from_millis(200),
        request_timeout: Duration::from_secs(2),
        cache_bytes: 64 * 1024,
        worker_threads: 2,
        chunker: small_chunks(),
        ..Default::default()
    }
}

pub fn small_chunks() -> ChunkerConfig {
    ChunkerConfig {
        min_size: 64,
        max_size: 1024,
        mask: 0x3F,
        ..Default::default()
    }
}

/// Deterministic bytes that chunk into several pieces
pub fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect()
}

/// Poll `condition` until it holds or ten seconds pass
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
