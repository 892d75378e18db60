//! Shared test fixture: an in-process mock worker.
//!
//! The worker serves all seven repository commands over a `MemoryBus`,
//! backed by an in-memory file store. It speaks the full chunk protocol on
//! both paths (reassembles chunked requests, chunks oversized replies), so
//! backend tests exercise exactly the wire behaviour a real worker sees.

// Allow dead code - these utilities are conditionally used by different
// test files
#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use nats_pipe::bus::{Bus, MemoryBus, PendingLimits, Subscription};
use nats_pipe::chunk::{read_message, send_reply};
use nats_pipe::command::{
    command_subject, FileEntry, ListReply, ListRequest, LoadReply, LoadRequest, MkdirReply,
    MkdirRequest, OpenReply, OpenRequest, RemoveReply, RemoveRequest, SaveReply, SaveRequest,
    StatReply, StatRequest,
};
use nats_pipe::message::{copy_protocol_headers, Message};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use nats_backend::{Config, NatsBackend};

static TRACING_INIT: Once = Once::new();

/// Initialize tracing once for the test process.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    });
}

/// Files the worker holds, keyed by full path within the bucket.
pub type Store = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// Concurrency gauge: tracks the high-water mark of simultaneous saves.
#[derive(Default)]
pub struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Tuning knobs for the mock worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Artificial delay inside every save handler.
    pub save_delay: Duration,
    /// Artificial delay inside every load handler.
    pub load_delay: Duration,
}

/// Handle on a running mock worker. Stops serving when dropped.
pub struct MockWorker {
    pub store: Store,
    pub mkdirs: Arc<Mutex<BTreeSet<String>>>,
    pub saves: Arc<Gauge>,
    cancel: CancellationToken,
}

impl Drop for MockWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl MockWorker {
    /// Put a file directly into the store.
    pub fn put(&self, path: &str, data: &[u8]) {
        self.store
            .lock()
            .unwrap()
            .insert(path.to_string(), data.to_vec());
    }

    pub fn contains(&self, path: &str) -> bool {
        self.store.lock().unwrap().contains_key(path)
    }
}

pub fn spawn_worker(bus: MemoryBus, config: WorkerConfig) -> MockWorker {
    let worker = MockWorker {
        store: Arc::new(Mutex::new(BTreeMap::new())),
        mkdirs: Arc::new(Mutex::new(BTreeSet::new())),
        saves: Arc::new(Gauge::default()),
        cancel: CancellationToken::new(),
    };

    for op in ["open", "stat", "mkdir", "save", "list", "load", "remove"] {
        let bus = bus.clone();
        let config = config.clone();
        let store = Arc::clone(&worker.store);
        let mkdirs = Arc::clone(&worker.mkdirs);
        let saves = Arc::clone(&worker.saves);
        let cancel = worker.cancel.clone();
        tokio::spawn(async move {
            let mut sub = bus
                .subscribe(&command_subject(op), "workers", PendingLimits::default())
                .await
                .expect("worker subscribe");
            loop {
                let msg = tokio::select! {
                    msg = sub.next() => match msg {
                        Some(msg) => msg,
                        None => return,
                    },
                    _ = cancel.cancelled() => return,
                };
                // One task per request so commands overlap like they would
                // on a real worker pool.
                let bus = bus.clone();
                let config = config.clone();
                let store = Arc::clone(&store);
                let mkdirs = Arc::clone(&mkdirs);
                let saves = Arc::clone(&saves);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let msg = match read_message(&bus, &cancel, msg).await {
                        Ok(msg) => msg,
                        Err(_) => return,
                    };
                    let payload = handle(op, &msg, &config, &store, &mkdirs, &saves).await;
                    let mut reply = Message::empty("");
                    reply.headers = copy_protocol_headers(&msg);
                    reply.payload = payload.into();
                    let _ = send_reply(&bus, &cancel, &msg, reply).await;
                });
            }
        });
    }
    worker
}

async fn handle(
    op: &str,
    msg: &Message,
    config: &WorkerConfig,
    store: &Store,
    mkdirs: &Arc<Mutex<BTreeSet<String>>>,
    saves: &Arc<Gauge>,
) -> Vec<u8> {
    match op {
        "open" => {
            let _req: OpenRequest = bincode::deserialize(&msg.payload).unwrap();
            bincode::serialize(&OpenReply { ok: true }).unwrap()
        }
        "stat" => {
            let req: StatRequest = bincode::deserialize(&msg.payload).unwrap();
            let reply = match store.lock().unwrap().get(&req.filename) {
                Some(data) => StatReply {
                    ok: true,
                    size: data.len() as u64,
                    name: req.filename.clone(),
                },
                None => StatReply {
                    ok: false,
                    size: 0,
                    name: String::new(),
                },
            };
            bincode::serialize(&reply).unwrap()
        }
        "mkdir" => {
            let req: MkdirRequest = bincode::deserialize(&msg.payload).unwrap();
            mkdirs.lock().unwrap().insert(req.dir);
            bincode::serialize(&MkdirReply { ok: true }).unwrap()
        }
        "save" => {
            let req: SaveRequest = bincode::deserialize(&msg.payload).unwrap();
            saves.enter();
            if !config.save_delay.is_zero() {
                tokio::time::sleep(config.save_delay).await;
            }
            let path = path_of(&req.dir, &req.name);
            store.lock().unwrap().insert(path, req.data);
            saves.exit();
            bincode::serialize(&SaveReply { ok: true }).unwrap()
        }
        "list" => {
            let req: ListRequest = bincode::deserialize(&msg.payload).unwrap();
            let prefix = format!("{}/", req.base_dir);
            let entries = store
                .lock()
                .unwrap()
                .iter()
                .filter(|(path, _)| {
                    path.starts_with(&prefix)
                        && (req.sub_dir || !path[prefix.len()..].contains('/'))
                })
                .map(|(path, data)| FileEntry {
                    name: path.rsplit('/').next().unwrap().to_string(),
                    size: data.len() as u64,
                })
                .collect();
            bincode::serialize(&ListReply { ok: true, entries }).unwrap()
        }
        "load" => {
            let req: LoadRequest = bincode::deserialize(&msg.payload).unwrap();
            if !config.load_delay.is_zero() {
                tokio::time::sleep(config.load_delay).await;
            }
            let path = path_of(&req.dir, &req.name);
            let reply = match store.lock().unwrap().get(&path) {
                Some(data) => {
                    let start = (req.offset as usize).min(data.len());
                    let end = if req.length == 0 {
                        data.len()
                    } else {
                        (start + req.length as usize).min(data.len())
                    };
                    LoadReply {
                        ok: true,
                        data: data[start..end].to_vec(),
                    }
                }
                None => LoadReply {
                    ok: false,
                    data: Vec::new(),
                },
            };
            bincode::serialize(&reply).unwrap()
        }
        "remove" => {
            let req: RemoveRequest = bincode::deserialize(&msg.payload).unwrap();
            let removed = store
                .lock()
                .unwrap()
                .remove(&path_of(&req.dir, &req.name))
                .is_some();
            bincode::serialize(&RemoveReply { ok: removed }).unwrap()
        }
        other => panic!("unhandled op {other}"),
    }
}

fn path_of(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{dir}/{name}")
    }
}

/// A backend wired to a fresh bus and mock worker.
pub struct Fixture {
    pub bus: MemoryBus,
    pub worker: MockWorker,
    pub backend: NatsBackend,
}

pub async fn open_fixture(connections: usize) -> Fixture {
    open_fixture_with(connections, WorkerConfig::default()).await
}

pub async fn open_fixture_with(connections: usize, config: WorkerConfig) -> Fixture {
    init_tracing();
    let bus = MemoryBus::new();
    let worker = spawn_worker(bus.clone(), config);
    let cfg = Config::parse(&format!(
        "nats://127.0.0.1/testrepo?connections={connections}"
    ))
    .expect("config");
    let backend = NatsBackend::open_with_bus(cfg, Arc::new(bus.clone()))
        .await
        .expect("open backend");
    Fixture {
        bus,
        worker,
        backend,
    }
}
