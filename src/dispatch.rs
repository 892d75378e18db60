//! Typed command dispatch.
//!
//! One logical round-trip per command: encode the request body, push it
//! through the chunk engine, decode the typed reply. A counting semaphore
//! caps how many round-trips are in flight at once; the permit is held for
//! the whole exchange and released on every exit path, including drop.

use std::sync::Arc;
use std::time::Instant;

use nats_pipe::bus::Bus;
use nats_pipe::chunk;
use nats_pipe::command::{command_subject, Command};
use nats_pipe::message::{Message, HEADER_OPERATION};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::backend::BackendError;

const TARGET: &str = "nats_backend::dispatch";

/// Serializes commands onto the bus under a concurrency cap.
pub(crate) struct Dispatcher {
    bus: Arc<dyn Bus>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub(crate) fn new(bus: Arc<dyn Bus>, connections: usize) -> Self {
        Self {
            bus,
            semaphore: Arc::new(Semaphore::new(connections)),
            cancel: CancellationToken::new(),
        }
    }

    /// Send `request` and await its typed reply.
    pub(crate) async fn send<C: Command>(&self, request: &C) -> Result<C::Reply, BackendError> {
        if self.cancel.is_cancelled() {
            return Err(BackendError::Closed);
        }
        let _permit = tokio::select! {
            permit = self.semaphore.acquire() => {
                permit.map_err(|_| BackendError::Closed)?
            }
            _ = self.cancel.cancelled() => return Err(BackendError::Closed),
        };

        let start = Instant::now();
        let mut msg = Message::new(command_subject(C::NAME));
        msg.headers.set(HEADER_OPERATION, C::NAME);
        msg.payload = bincode::serialize(request)
            .map_err(BackendError::Encode)?
            .into();
        msg.reply = Some(self.bus.new_inbox());

        let msgid = msg.msg_id().unwrap_or_default().to_string();
        let sent = msg.payload.len();

        let reply = chunk::send_request(self.bus.as_ref(), &self.cancel, msg)
            .await
            .map_err(|source| {
                debug!(
                    target: TARGET,
                    op = C::NAME,
                    msgid = %msgid,
                    elapsed = ?start.elapsed(),
                    bytes = sent,
                    error = %source,
                    "command failed"
                );
                BackendError::Command {
                    op: C::NAME,
                    source,
                }
            })?;

        let decoded = bincode::deserialize(&reply.payload).map_err(BackendError::Decode)?;
        debug!(
            target: TARGET,
            op = C::NAME,
            msgid = %msgid,
            elapsed = ?start.elapsed(),
            bytes = sent,
            reply_bytes = reply.payload.len(),
            "command round-trip"
        );
        Ok(decoded)
    }

    /// Abort in-flight chunk waits and refuse new commands.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    pub(crate) fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nats_pipe::bus::{MemoryBus, PendingLimits, Subscription};
    use nats_pipe::command::{OpenReply, OpenRequest};
    use nats_pipe::message::copy_protocol_headers;

    fn spawn_open_worker(bus: MemoryBus) {
        tokio::spawn(async move {
            let mut sub = bus
                .subscribe("repo.commands.open", "workers", PendingLimits::default())
                .await
                .unwrap();
            let cancel = CancellationToken::new();
            while let Some(msg) = sub.next().await {
                let msg = chunk::read_message(&bus, &cancel, msg).await.unwrap();
                let req: OpenRequest = bincode::deserialize(&msg.payload).unwrap();
                let mut reply = Message::empty("");
                reply.headers = copy_protocol_headers(&msg);
                reply.payload = bincode::serialize(&OpenReply {
                    ok: req.bucket == "good",
                })
                .unwrap()
                .into();
                chunk::send_reply(&bus, &cancel, &msg, reply).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_send_round_trip() {
        let bus = MemoryBus::new();
        spawn_open_worker(bus.clone());
        let dispatcher = Dispatcher::new(Arc::new(bus), 2);

        let reply = dispatcher
            .send(&OpenRequest {
                bucket: "good".into(),
            })
            .await
            .unwrap();
        assert!(reply.ok);
        assert_eq!(dispatcher.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_transport_error_carries_command_name() {
        let bus = MemoryBus::new();
        // No worker subscribed.
        let dispatcher = Dispatcher::new(Arc::new(bus), 1);
        let err = dispatcher
            .send(&OpenRequest {
                bucket: "any".into(),
            })
            .await
            .unwrap_err();
        match err {
            BackendError::Command { op, .. } => assert_eq!(op, "open"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(dispatcher.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_commands() {
        let bus = MemoryBus::new();
        spawn_open_worker(bus.clone());
        let dispatcher = Dispatcher::new(Arc::new(bus), 1);
        dispatcher.shutdown();
        let err = dispatcher
            .send(&OpenRequest {
                bucket: "good".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Closed));
    }
}
