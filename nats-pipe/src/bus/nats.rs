//! NATS bus implementation.
//!
//! Thin adapter from the [`Bus`] traits onto `async-nats`. Connection
//! handling stays here: credentials, capability checks (max payload,
//! header support), and connection event logging. Everything above this
//! module is transport-agnostic.

use std::path::Path;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info};

use crate::chunk::MIN_MAX_PAYLOAD;
use crate::message::{Headers, Message};

use super::traits::{Bus, BusError, PendingLimits, Subscription};

/// [`Bus`] backed by a NATS connection.
pub struct NatsBus {
    client: async_nats::Client,
    max_payload: usize,
}

impl NatsBus {
    /// Connect to `url` authenticating with `credential_file`.
    ///
    /// Fails when the server advertises a max payload below the protocol
    /// minimum or does not support message headers.
    pub async fn connect(url: &str, credential_file: &Path) -> Result<Self, BusError> {
        let options = async_nats::ConnectOptions::with_credentials_file(credential_file.to_path_buf())
            .await?
            // Connection-wide bound standing in for per-subscription
            // pending limits; matches the reassembly envelope's message
            // count.
            .subscription_capacity(1000)
            .event_callback(|event| async move {
                info!(target: "nats_pipe::bus", %event, "connection event");
            });

        let client = options
            .connect(url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;

        let info = client.server_info();
        if (info.max_payload as usize) < MIN_MAX_PAYLOAD {
            return Err(BusError::Unsupported(format!(
                "server max payload {} is below the required {}",
                info.max_payload, MIN_MAX_PAYLOAD
            )));
        }
        if !info.headers {
            return Err(BusError::Unsupported(
                "server does not support message headers".into(),
            ));
        }

        info!(
            target: "nats_pipe::bus",
            server = %info.server_name,
            max_payload = info.max_payload,
            "connected"
        );

        Ok(Self {
            max_payload: info.max_payload as usize,
            client,
        })
    }
}

fn to_header_map(headers: &Headers) -> async_nats::HeaderMap {
    let mut map = async_nats::HeaderMap::new();
    for (name, value) in headers.iter() {
        map.insert(name, value);
    }
    map
}

fn from_nats(msg: async_nats::Message) -> Message {
    let mut headers = Headers::new();
    if let Some(map) = &msg.headers {
        for (name, values) in map.iter() {
            if let Some(value) = values.first() {
                headers.set(name.as_ref(), value.as_str());
            }
        }
    }
    Message {
        subject: msg.subject.to_string(),
        reply: msg.reply.map(|r| r.to_string()),
        headers,
        payload: msg.payload,
    }
}

#[async_trait]
impl Bus for NatsBus {
    async fn request(&self, msg: Message) -> Result<Message, BusError> {
        let subject = msg.subject.clone();
        let reply = self
            .client
            .request_with_headers(msg.subject, to_header_map(&msg.headers), msg.payload)
            .await
            .map_err(|e| match e.kind() {
                async_nats::RequestErrorKind::NoResponders => BusError::NoResponders(subject),
                _ => BusError::Request(e.to_string()),
            })?;
        Ok(from_nats(reply))
    }

    async fn publish(&self, msg: Message) -> Result<(), BusError> {
        let headers = to_header_map(&msg.headers);
        let result = match msg.reply {
            Some(reply) => {
                self.client
                    .publish_with_reply_and_headers(msg.subject, reply, headers, msg.payload)
                    .await
            }
            None => {
                self.client
                    .publish_with_headers(msg.subject, headers, msg.payload)
                    .await
            }
        };
        result.map_err(|e| BusError::Publish(e.to_string()))?;
        // Publishes are buffered client-side; flush so fire-and-forget
        // chunks leave promptly.
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue: &str,
        limits: PendingLimits,
    ) -> Result<Box<dyn Subscription>, BusError> {
        // The client exposes no per-subscription pending limits: the
        // message bound is approximated by the connection-wide
        // subscription capacity set at connect, and the byte bound is
        // enforced upstream by the per-chunk ack flow control (at most
        // one unacknowledged chunk is ever in flight per transfer).
        debug!(
            target: "nats_pipe::bus",
            subject,
            queue,
            max_messages = limits.max_messages,
            max_bytes = limits.max_bytes,
            "subscribing"
        );
        let subscriber = self
            .client
            .queue_subscribe(subject.to_string(), queue.to_string())
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;
        Ok(Box::new(NatsSubscription { subscriber }))
    }

    fn new_inbox(&self) -> String {
        self.client.new_inbox()
    }

    fn max_payload(&self) -> usize {
        self.max_payload
    }
}

struct NatsSubscription {
    subscriber: async_nats::Subscriber,
}

#[async_trait]
impl Subscription for NatsSubscription {
    async fn next(&mut self) -> Option<Message> {
        self.subscriber.next().await.map(from_nats)
    }
}
