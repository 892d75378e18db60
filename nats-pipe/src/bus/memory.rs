//! In-process bus implementation.
//!
//! Single-process stand-in for a real bus, used by the test suite and by
//! local development against a mock worker. Semantics kept deliberately
//! close to NATS core:
//!
//! - exact subject matching (no wildcards),
//! - queue groups deliver each message to one member per group,
//! - per-subscription message and byte budgets (the chunk path passes the
//!   reassembly envelope of 1000 messages / 64 MiB); overflow drops the
//!   message the way a slow consumer would,
//! - `max_payload` enforced on every publish,
//! - a request with no subscribers fails fast with `NoResponders`.
//!
//! One piece of deployment config is modelled here as well: production
//! servers map the chunk send-side subjects onto the receive-side
//! subjects (`chunk.[acc.]send.X` -> `chunk.[acc.]recv.X`), which is how
//! a sender's chunks reach the receiver's transfer subscription. This bus
//! applies the same mapping at delivery time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::message::Message;

use super::traits::{Bus, BusError, PendingLimits, Subscription};

/// Default max payload: the smallest server configuration the protocol
/// supports.
pub const DEFAULT_MAX_PAYLOAD: usize = 8 * 1024 * 1024;

struct Entry {
    id: u64,
    queue: String,
    tx: mpsc::Sender<Message>,
    pending_bytes: Arc<AtomicUsize>,
    max_bytes: usize,
}

/// A delivery target resolved under the topics lock.
struct Target {
    tx: mpsc::Sender<Message>,
    pending_bytes: Arc<AtomicUsize>,
    max_bytes: usize,
}

struct Inner {
    topics: Mutex<HashMap<String, Vec<Entry>>>,
    /// Every subject ever subscribed, in order. Test instrumentation.
    history: Mutex<Vec<String>>,
    max_payload: usize,
    next_id: AtomicU64,
}

/// In-process [`Bus`].
#[derive(Clone)]
pub struct MemoryBus {
    inner: Arc<Inner>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: Mutex::new(HashMap::new()),
                history: Mutex::new(Vec::new()),
                max_payload,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Number of live subscriptions whose subject starts with `prefix`.
    /// Test instrumentation.
    pub fn active_subscriptions(&self, prefix: &str) -> usize {
        let topics = self.inner.topics.lock().unwrap();
        topics
            .iter()
            .filter(|(subject, entries)| subject.starts_with(prefix) && !entries.is_empty())
            .map(|(_, entries)| entries.len())
            .sum()
    }

    /// All subjects ever subscribed, in subscription order. Test
    /// instrumentation.
    pub fn subscribed_subjects(&self) -> Vec<String> {
        self.inner.history.lock().unwrap().clone()
    }

    /// Deliver `msg`, returning how many subscribers received it.
    fn deliver(&self, msg: &Message) -> Result<usize, BusError> {
        if msg.payload.len() > self.inner.max_payload {
            return Err(BusError::PayloadTooLarge {
                size: msg.payload.len(),
                max: self.inner.max_payload,
            });
        }

        let mut targets = Vec::new();
        {
            let mut topics = self.inner.topics.lock().unwrap();
            let mut collect = |subject: &str, targets: &mut Vec<Target>| {
                if let Some(entries) = topics.get_mut(subject) {
                    entries.retain(|e| !e.tx.is_closed());
                    // One member per queue group.
                    let mut groups: Vec<String> = Vec::new();
                    for entry in entries.iter() {
                        if !groups.contains(&entry.queue) {
                            groups.push(entry.queue.clone());
                            targets.push(Target {
                                tx: entry.tx.clone(),
                                pending_bytes: Arc::clone(&entry.pending_bytes),
                                max_bytes: entry.max_bytes,
                            });
                        }
                    }
                }
            };
            collect(&msg.subject, &mut targets);
            if let Some(mapped) = map_chunk_subject(&msg.subject) {
                collect(&mapped, &mut targets);
            }
        }

        let len = msg.payload.len();
        let mut delivered = 0;
        for target in targets {
            if target.pending_bytes.load(Ordering::SeqCst) + len > target.max_bytes {
                warn!(
                    target: "nats_pipe::bus",
                    subject = %msg.subject,
                    bytes = len,
                    "slow consumer over byte budget, dropping message"
                );
                continue;
            }
            // Account before sending so the receiver can never subtract
            // bytes that were not yet added.
            target.pending_bytes.fetch_add(len, Ordering::SeqCst);
            match target.tx.try_send(msg.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    target.pending_bytes.fetch_sub(len, Ordering::SeqCst);
                    warn!(
                        target: "nats_pipe::bus",
                        subject = %msg.subject,
                        "slow consumer over message budget, dropping message"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    target.pending_bytes.fetch_sub(len, Ordering::SeqCst);
                }
            }
        }
        Ok(delivered)
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-side subject mapping for chunk transfers: the sender publishes
/// on `chunk.[acc.]send.X`, the receiver listens on `chunk.[acc.]recv.X`.
fn map_chunk_subject(subject: &str) -> Option<String> {
    if !subject.starts_with("chunk.") || !subject.contains(".send.") {
        return None;
    }
    Some(subject.replacen(".send.", ".recv.", 1))
}

#[async_trait]
impl Bus for MemoryBus {
    async fn request(&self, mut msg: Message) -> Result<Message, BusError> {
        let inbox = self.new_inbox();
        let mut sub = self
            .subscribe(&inbox, &inbox, PendingLimits::default())
            .await?;
        msg.reply = Some(inbox);
        let delivered = self.deliver(&msg)?;
        if delivered == 0 {
            return Err(BusError::NoResponders(msg.subject));
        }
        sub.next().await.ok_or(BusError::Closed)
    }

    async fn publish(&self, msg: Message) -> Result<(), BusError> {
        self.deliver(&msg)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue: &str,
        limits: PendingLimits,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let (tx, rx) = mpsc::channel(limits.max_messages.max(1));
        let pending_bytes = Arc::new(AtomicUsize::new(0));
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut topics = self.inner.topics.lock().unwrap();
            topics.entry(subject.to_string()).or_default().push(Entry {
                id,
                queue: queue.to_string(),
                tx,
                pending_bytes: Arc::clone(&pending_bytes),
                max_bytes: limits.max_bytes,
            });
        }
        self.inner.history.lock().unwrap().push(subject.to_string());
        Ok(Box::new(MemorySubscription {
            rx,
            subject: subject.to_string(),
            id,
            inner: Arc::clone(&self.inner),
            pending_bytes,
        }))
    }

    fn new_inbox(&self) -> String {
        format!(
            "_INBOX.{}",
            self.inner.next_id.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn max_payload(&self) -> usize {
        self.inner.max_payload
    }
}

struct MemorySubscription {
    rx: mpsc::Receiver<Message>,
    subject: String,
    id: u64,
    inner: Arc<Inner>,
    pending_bytes: Arc<AtomicUsize>,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<Message> {
        let msg = self.rx.recv().await?;
        self.pending_bytes
            .fetch_sub(msg.payload.len(), Ordering::SeqCst);
        Some(msg)
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        let mut topics = self.inner.topics.lock().unwrap();
        if let Some(entries) = topics.get_mut(&self.subject) {
            entries.retain(|e| e.id != self.id);
            if entries.is_empty() {
                topics.remove(&self.subject);
            }
        }
    }
}
