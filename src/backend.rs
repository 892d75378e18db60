//! Repository backend over the bus.
//!
//! `NatsBackend` implements the [`Backend`] contract by translating each
//! operation into exactly one typed command round-trip. It owns no
//! execution: callers arrive concurrently and the dispatcher's semaphore
//! is the only throttle.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use nats_pipe::bus::{Bus, BusError, NatsBus};
use nats_pipe::chunk::MIN_MAX_PAYLOAD;
use nats_pipe::command::{
    ListRequest, LoadRequest, MkdirRequest, OpenRequest, RemoveRequest, SaveRequest, StatRequest,
};
use nats_pipe::ProtocolError;
use sha2::Sha256;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::config::{Config, ConfigError};
use crate::dispatch::Dispatcher;
use crate::layout::{join, DefaultLayout, FileType, Handle};
use crate::reader::RewindReader;

const TARGET: &str = "nats_backend::backend";

/// Backend error types.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("credential file missing: {0}")]
    MissingCredentials(String),

    #[error("unsupported bus capability: {0}")]
    Unsupported(String),

    #[error("{op}: {source}")]
    Command {
        op: &'static str,
        #[source]
        source: ProtocolError,
    },

    #[error("encoding request failed: {0}")]
    Encode(#[source] bincode::Error),

    #[error("decoding reply failed: {0}")]
    Decode(#[source] bincode::Error),

    #[error("{0} does not exist")]
    NotFound(String),

    #[error("config file already exists")]
    AlreadyExists,

    #[error("{op} failed on the remote worker")]
    CommandFailed { op: &'static str },

    #[error("backend is closed")]
    Closed,

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Metadata for a single repository file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// Callback receiving loaded file contents. Invoked exactly once per
/// successful load.
pub type LoadFn<'a> = &'a mut (dyn FnMut(&mut dyn std::io::Read) -> std::io::Result<()> + Send);

/// Callback receiving one list entry at a time, in reply order. Returning
/// an error stops the listing.
pub type ListFn<'a> = &'a mut (dyn FnMut(FileInfo) -> Result<(), BackendError> + Send);

/// The storage contract a repository backend provides.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Type and location of the repository, for display.
    fn location(&self) -> String;

    /// Content hash the backend wants callers to precompute, if any.
    fn hasher(&self) -> Option<Sha256>;

    /// Whether a file exists.
    async fn test(&self, h: &Handle) -> Result<bool, BackendError>;

    /// Size and name of a file.
    async fn stat(&self, h: &Handle) -> Result<FileInfo, BackendError>;

    /// Store the contents of `rd` under `h`.
    async fn save(&self, h: &Handle, rd: &mut dyn RewindReader) -> Result<(), BackendError>;

    /// Fetch the contents of `h` and hand them to `f` as a reader. A zero
    /// `length` means the whole file from `offset`.
    async fn load(
        &self,
        h: &Handle,
        length: u32,
        offset: u64,
        f: LoadFn<'_>,
    ) -> Result<(), BackendError>;

    /// Call `f` once per file of type `t`, in the order the worker
    /// returned them. Runs on the caller's task.
    async fn list(&self, t: FileType, f: ListFn<'_>) -> Result<(), BackendError>;

    /// Remove the file `h`.
    async fn remove(&self, h: &Handle) -> Result<(), BackendError>;

    /// Remove everything the repository holds, the config file last.
    async fn delete(&self) -> Result<(), BackendError>;

    /// Release the bus connection. In-flight operations are aborted.
    async fn close(&self) -> Result<(), BackendError>;

    /// Whether `err` means a file was absent.
    fn is_not_exist(&self, err: &BackendError) -> bool;

    /// POSIX path join.
    fn join(&self, parts: &[&str]) -> String;
}

/// [`Backend`] speaking the chunked command protocol over a bus.
pub struct NatsBackend {
    cfg: Config,
    layout: DefaultLayout,
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for NatsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBackend")
            .field("cfg", &self.cfg)
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// Check the credential file and establish the bus connection.
async fn connect_bus(cfg: &Config) -> Result<Arc<dyn Bus>, BackendError> {
    let credential = cfg
        .credential_file
        .clone()
        .ok_or_else(|| BackendError::MissingCredentials("no credential file configured".into()))?;
    if tokio::fs::metadata(&credential).await.is_err() {
        return Err(BackendError::MissingCredentials(
            credential.display().to_string(),
        ));
    }

    let bus = NatsBus::connect(&cfg.server_url(), &credential)
        .await
        .map_err(|e| match e {
            BusError::Unsupported(msg) => BackendError::Unsupported(msg),
            other => BackendError::Bus(other),
        })?;
    Ok(Arc::new(bus))
}

impl NatsBackend {
    /// Connect to the configured server and open the repository bucket.
    pub async fn open(cfg: Config) -> Result<Self, BackendError> {
        let bus = connect_bus(&cfg).await?;
        Self::open_with_bus(cfg, bus).await
    }

    /// Open the repository bucket over an already-connected bus.
    pub async fn open_with_bus(cfg: Config, bus: Arc<dyn Bus>) -> Result<Self, BackendError> {
        debug!(target: TARGET, server = %cfg.server, repo = %cfg.repo, "opening repository");
        if bus.max_payload() < MIN_MAX_PAYLOAD {
            return Err(BackendError::Unsupported(format!(
                "bus max payload {} is below the required {}",
                bus.max_payload(),
                MIN_MAX_PAYLOAD
            )));
        }

        let backend = Self {
            layout: DefaultLayout,
            dispatcher: Dispatcher::new(bus, cfg.connections),
            cfg,
        };

        let reply = backend
            .dispatcher
            .send(&OpenRequest {
                bucket: backend.cfg.repo.clone(),
            })
            .await?;
        if !reply.ok {
            return Err(BackendError::CommandFailed { op: "open" });
        }
        Ok(backend)
    }

    /// Create a fresh repository: the bucket must not already hold a
    /// config file. Lays out every repository directory.
    pub async fn create(cfg: Config) -> Result<Self, BackendError> {
        let bus = connect_bus(&cfg).await?;
        Self::create_with_bus(cfg, bus).await
    }

    /// [`Self::create`] over an already-connected bus.
    pub async fn create_with_bus(cfg: Config, bus: Arc<dyn Bus>) -> Result<Self, BackendError> {
        let backend = Self::open_with_bus(cfg, bus).await?;
        if backend.stat(&Handle::config()).await.is_ok() {
            return Err(BackendError::AlreadyExists);
        }
        for dir in backend.layout.paths() {
            backend.mkdir(&dir).await?;
        }
        Ok(backend)
    }

    /// Create a directory in the repository bucket.
    pub async fn mkdir(&self, dir: &str) -> Result<(), BackendError> {
        debug!(target: TARGET, repo = %self.cfg.repo, dir, "mkdir");
        let reply = self
            .dispatcher
            .send(&MkdirRequest {
                bucket: self.cfg.repo.clone(),
                dir: dir.to_string(),
            })
            .await?;
        if reply.ok {
            Ok(())
        } else {
            Err(BackendError::CommandFailed { op: "mkdir" })
        }
    }
}

#[async_trait]
impl Backend for NatsBackend {
    fn location(&self) -> String {
        self.cfg.server.to_string()
    }

    fn hasher(&self) -> Option<Sha256> {
        None
    }

    async fn test(&self, h: &Handle) -> Result<bool, BackendError> {
        match self.stat(h).await {
            Ok(_) => Ok(true),
            Err(BackendError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn stat(&self, h: &Handle) -> Result<FileInfo, BackendError> {
        let filename = self.layout.filename(h);
        debug!(target: TARGET, repo = %self.cfg.repo, file = %filename, "stat");
        let reply = self
            .dispatcher
            .send(&StatRequest {
                bucket: self.cfg.repo.clone(),
                filename: filename.clone(),
            })
            .await?;
        if reply.ok {
            Ok(FileInfo {
                size: reply.size,
                name: h.name.clone(),
            })
        } else {
            Err(BackendError::NotFound(filename))
        }
    }

    async fn save(&self, h: &Handle, rd: &mut dyn RewindReader) -> Result<(), BackendError> {
        let filesize = rd.length();
        let mut data = Vec::with_capacity(filesize as usize);
        rd.read_to_end(&mut data).await?;

        debug!(
            target: TARGET,
            repo = %self.cfg.repo,
            file = %self.layout.filename(h),
            bytes = data.len(),
            "save"
        );
        let reply = self
            .dispatcher
            .send(&SaveRequest {
                bucket: self.cfg.repo.clone(),
                dir: self.layout.dirname(h),
                name: self.layout.basename(h),
                filesize,
                packet_size: data.len() as u32,
                offset: 0,
                data,
            })
            .await?;
        if reply.ok {
            Ok(())
        } else {
            Err(BackendError::CommandFailed { op: "save" })
        }
    }

    async fn load(
        &self,
        h: &Handle,
        length: u32,
        offset: u64,
        f: LoadFn<'_>,
    ) -> Result<(), BackendError> {
        debug!(
            target: TARGET,
            repo = %self.cfg.repo,
            file = %self.layout.filename(h),
            length,
            offset,
            "load"
        );
        let reply = self
            .dispatcher
            .send(&LoadRequest {
                bucket: self.cfg.repo.clone(),
                dir: self.layout.dirname(h),
                name: self.layout.basename(h),
                length,
                offset,
            })
            .await?;
        if !reply.ok {
            return Err(BackendError::CommandFailed { op: "load" });
        }
        let mut rd = std::io::Cursor::new(Bytes::from(reply.data));
        f(&mut rd)?;
        Ok(())
    }

    async fn list(&self, t: FileType, f: ListFn<'_>) -> Result<(), BackendError> {
        let (base_dir, sub_dir) = self.layout.basedir(t);
        debug!(
            target: TARGET,
            repo = %self.cfg.repo,
            dir = %base_dir,
            recursive = sub_dir,
            "list"
        );
        let reply = self
            .dispatcher
            .send(&ListRequest {
                bucket: self.cfg.repo.clone(),
                base_dir,
                sub_dir,
            })
            .await?;
        if !reply.ok {
            return Err(BackendError::CommandFailed { op: "list" });
        }
        for entry in reply.entries {
            f(FileInfo {
                name: entry.name,
                size: entry.size,
            })?;
        }
        Ok(())
    }

    async fn remove(&self, h: &Handle) -> Result<(), BackendError> {
        debug!(
            target: TARGET,
            repo = %self.cfg.repo,
            file = %self.layout.filename(h),
            "remove"
        );
        let reply = self
            .dispatcher
            .send(&RemoveRequest {
                bucket: self.cfg.repo.clone(),
                dir: self.layout.dirname(h),
                name: self.layout.basename(h),
            })
            .await?;
        if reply.ok {
            Ok(())
        } else {
            Err(BackendError::CommandFailed { op: "remove" })
        }
    }

    async fn delete(&self) -> Result<(), BackendError> {
        for t in FileType::DIRS {
            let mut names = Vec::new();
            self.list(t, &mut |fi| {
                names.push(fi.name);
                Ok(())
            })
            .await?;
            for name in names {
                self.remove(&Handle::new(t, name)).await?;
            }
        }
        self.remove(&Handle::config()).await
    }

    async fn close(&self) -> Result<(), BackendError> {
        debug!(target: TARGET, repo = %self.cfg.repo, "closing");
        self.dispatcher.shutdown();
        Ok(())
    }

    fn is_not_exist(&self, err: &BackendError) -> bool {
        matches!(err, BackendError::NotFound(_))
    }

    fn join(&self, parts: &[&str]) -> String {
        join(parts)
    }
}
