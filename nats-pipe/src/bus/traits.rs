//! Bus trait definitions.
//!
//! The bus is the seam between the chunk protocol and the underlying
//! message system: request/reply with private inboxes, fire-and-forget
//! publish, queue subscriptions, and a bounded per-message payload. The
//! protocol layer only ever talks to these traits, so tests run against an
//! in-process bus and production runs against NATS.

use async_trait::async_trait;

use crate::message::Message;

/// Bus error types.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("subscribe failed: {0}")]
    Subscribe(String),

    #[error("no responders on subject {0}")]
    NoResponders(String),

    #[error("payload of {size} bytes exceeds bus max payload of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("unsupported server capability: {0}")]
    Unsupported(String),

    #[error("bus connection closed")]
    Closed,
}

/// Buffering bounds for a subscription.
///
/// A subscriber that stops draining has its overflow dropped the way a
/// slow consumer would; the sender is never blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLimits {
    /// Most undelivered messages a subscription will buffer.
    pub max_messages: usize,
    /// Most undelivered payload bytes a subscription will buffer.
    pub max_bytes: usize,
}

impl Default for PendingLimits {
    /// The chunk-reassembly envelope: 1000 messages, 64 MiB.
    fn default() -> Self {
        Self {
            max_messages: 1000,
            max_bytes: 64 * 1024 * 1024,
        }
    }
}

/// An asynchronous message bus.
///
/// Implementations must be safe to share across tasks; all in-flight
/// operations of a process use one connection.
#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish `msg` on a fresh private inbox and await the first reply.
    ///
    /// The returned message carries its own reply subject when the
    /// responder expects a follow-up (chunk acks work this way).
    async fn request(&self, msg: Message) -> Result<Message, BusError>;

    /// Fire-and-forget publish. Honours `msg.reply` and headers when set.
    async fn publish(&self, msg: Message) -> Result<(), BusError>;

    /// Queue subscription on `subject`, buffering at most `limits`.
    /// Dropping the returned subscription unsubscribes.
    async fn subscribe(
        &self,
        subject: &str,
        queue: &str,
        limits: PendingLimits,
    ) -> Result<Box<dyn Subscription>, BusError>;

    /// Fresh private inbox subject.
    fn new_inbox(&self) -> String;

    /// Largest payload the bus accepts in a single message.
    fn max_payload(&self) -> usize;
}

/// A stream of messages from a subscription.
#[async_trait]
pub trait Subscription: Send {
    /// Next message, or None once the subscription or connection closed.
    async fn next(&mut self) -> Option<Message>;
}
