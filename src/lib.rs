//! Message-bus backend for a content-addressed backup repository.
//!
//! Instead of a filesystem or an HTTP server, repository operations travel
//! over NATS: each save/load/list/stat/remove/mkdir call becomes a typed
//! request message on a well-known subject, answered by a remote worker.
//! Payloads larger than the bus's per-message cap are split into an
//! acknowledged chunk stream by the `nats-pipe` protocol crate.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use nats_backend::{Backend, Config, NatsBackend};
//!
//! let cfg = Config::parse("nats://backup.example.com/team/repo?credentialfile=/etc/nats/backup.creds")?;
//! let backend = NatsBackend::open(cfg).await?;
//! let info = backend.stat(&Handle::config()).await?;
//! ```
//!
//! Concurrency is capped by a per-backend semaphore (`connections`,
//! default 5); every command holds one permit for the duration of its bus
//! round-trip.

pub mod backend;
pub mod config;
mod dispatch;
pub mod layout;
pub mod reader;

pub use backend::{Backend, BackendError, FileInfo, ListFn, LoadFn, NatsBackend};
pub use config::{Config, ConfigError, DEFAULT_CONNECTIONS, DEFAULT_PORT};
pub use layout::{join, DefaultLayout, FileType, Handle};
pub use reader::{ByteReader, RewindReader};
