//! Chunked request/reply transfer engine.
//!
//! The bus caps single-message payloads, but repository blobs routinely
//! exceed that cap. This module splits a logical message into a negotiated
//! side-channel of chunk messages and reassembles it on the far side:
//!
//! ```text
//! sender                                   receiver
//!   │ initial chunk (CHUNKS=P, bytes 0..M)   │
//!   ├───────────────────────────────────────►│ subscribe chunk.recv.<id>
//!   │◄───────────────────────────────────────┤ control reply (CHUNK-SUBJECT)
//!   │ chunk 1 (SEQ=1)                        │
//!   ├───────────────────────────────────────►│
//!   │◄───────────────────────────────────────┤ ack
//!   │ ...                                    │
//!   │ chunk P (SEQ=P)                        │
//!   ├───────────────────────────────────────►│ reassembly complete
//!   │◄───────────────────────────────────────┤ logical reply
//! ```
//!
//! Chunks before the last are acknowledged before the next is sent, which
//! gives back-pressure proportional to round-trip time without any extra
//! machinery. On the request path the final chunk is itself a request and
//! its reply is the logical reply; on the reply path the final chunk is
//! published fire-and-forget.

use bytes::BytesMut;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::{Bus, BusError, PendingLimits, Subscription};
use crate::message::{
    copy_protocol_headers, new_id, request_info, Message, HEADER_CHUNKS, HEADER_CHUNK_SEQ,
    HEADER_CHUNK_SUBJECT,
};

/// Largest chunk the engine will put in a single bus message.
///
/// Nominally 0.95 x the bus max payload, pinned to 0.95 x 1,024,000 so
/// chunks stay safely below a 1 MiB server-side cap regardless of what the
/// connected server advertises.
pub const MAX_CHUNK_SIZE: usize = 972_800;

/// Smallest bus max payload the protocol supports. Checked at connect.
pub const MIN_MAX_PAYLOAD: usize = 8 * 1024 * 1024;

const TARGET: &str = "nats_pipe::chunk";

/// Chunk transfer error types.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message id not set")]
    MissingMessageId,

    #[error("chunked reply did not include a transfer id")]
    MissingChunkSubject,

    #[error("message has no reply subject")]
    MissingReplySubject,

    #[error("invalid chunk count {0:?}")]
    BadChunkCount(String),

    #[error("chunk missing sequence header")]
    MissingChunkSeq,

    #[error("chunk out of order: expected {expected}, got {got}")]
    ChunkOutOfOrder { expected: usize, got: usize },

    #[error("cancelled while waiting on chunk transfer")]
    Cancelled,

    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Send a logical request and return the logical reply, transparently
/// chunking the request and reassembling the reply as needed.
pub async fn send_request(
    bus: &dyn Bus,
    cancel: &CancellationToken,
    msg: Message,
) -> Result<Message, ProtocolError> {
    let msg_id = msg.msg_id().ok_or(ProtocolError::MissingMessageId)?.to_string();
    let size = msg.payload.len();

    if size < MAX_CHUNK_SIZE {
        debug!(target: TARGET, msgid = %msg_id, bytes = size, "single-shot request");
        let reply = request(bus, cancel, msg).await?;
        return read_message(bus, cancel, reply).await;
    }

    let pages = size / MAX_CHUNK_SIZE;
    let mut initial = Message::empty(msg.subject.as_str());
    initial.headers = copy_protocol_headers(&msg);
    initial.headers.set(HEADER_CHUNKS, pages.to_string());
    initial.payload = msg.payload.slice(0..MAX_CHUNK_SIZE);
    debug!(
        target: TARGET,
        msgid = %msg_id,
        pages,
        bytes = size,
        "chunking request"
    );

    let control = request(bus, cancel, initial).await?;
    let transfer_id = control
        .headers
        .get(HEADER_CHUNK_SUBJECT)
        .filter(|v| !v.is_empty())
        .ok_or(ProtocolError::MissingChunkSubject)?
        .to_string();
    let subject = send_subject(&control, &transfer_id);

    for page in 1..pages {
        let ack = request(bus, cancel, chunk_message(&msg, &subject, page, size)).await?;
        debug!(
            target: TARGET,
            msgid = %msg_id,
            page,
            pages,
            ack_subject = %ack.subject,
            "chunk acked"
        );
    }

    let reply = request(bus, cancel, chunk_message(&msg, &subject, pages, size)).await?;
    debug!(
        target: TARGET,
        msgid = %msg_id,
        pages,
        reply_bytes = reply.payload.len(),
        "final chunk answered"
    );
    read_message(bus, cancel, reply).await
}

/// Send a logical reply to `incoming`, chunking when the payload exceeds
/// [`MAX_CHUNK_SIZE`]. The final chunk is published fire-and-forget.
pub async fn send_reply(
    bus: &dyn Bus,
    cancel: &CancellationToken,
    incoming: &Message,
    msg: Message,
) -> Result<(), ProtocolError> {
    let msg_id = msg.msg_id().ok_or(ProtocolError::MissingMessageId)?.to_string();
    let reply_to = incoming
        .reply
        .clone()
        .ok_or(ProtocolError::MissingReplySubject)?;
    let size = msg.payload.len();

    if size < MAX_CHUNK_SIZE {
        debug!(target: TARGET, msgid = %msg_id, bytes = size, "single-shot reply");
        let mut reply = msg;
        reply.subject = reply_to;
        reply.reply = None;
        return Ok(bus.publish(reply).await?);
    }

    let pages = size / MAX_CHUNK_SIZE;
    let mut initial = Message::empty(reply_to);
    initial.headers = copy_protocol_headers(&msg);
    initial.headers.set(HEADER_CHUNKS, pages.to_string());
    initial.payload = msg.payload.slice(0..MAX_CHUNK_SIZE);
    debug!(target: TARGET, msgid = %msg_id, pages, bytes = size, "chunking reply");

    let control = request(bus, cancel, initial).await?;
    let transfer_id = control
        .headers
        .get(HEADER_CHUNK_SUBJECT)
        .filter(|v| !v.is_empty())
        .ok_or(ProtocolError::MissingChunkSubject)?
        .to_string();
    // The account prefix comes from the request we are answering.
    let subject = send_subject(incoming, &transfer_id);

    for page in 1..pages {
        request(bus, cancel, chunk_message(&msg, &subject, page, size)).await?;
    }
    bus.publish(chunk_message(&msg, &subject, pages, size))
        .await?;
    debug!(target: TARGET, msgid = %msg_id, pages, "reply chunks sent");
    Ok(())
}

/// Resolve a possibly-chunked message into a complete logical message.
///
/// A message without a chunk-count header passes through untouched.
/// Otherwise this negotiates a transfer subject, collects every follow-on
/// chunk in order (acknowledging all but the last), and returns the
/// reassembled message. The last chunk's reply subject is adopted so the
/// caller can answer the sender. The chunk subscription is torn down on
/// every exit path.
pub async fn read_message(
    bus: &dyn Bus,
    cancel: &CancellationToken,
    mut msg: Message,
) -> Result<Message, ProtocolError> {
    msg.msg_id().ok_or(ProtocolError::MissingMessageId)?;
    let pages = match msg.headers.get(HEADER_CHUNKS).filter(|v| !v.is_empty()) {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ProtocolError::BadChunkCount(raw.to_string()))?,
        None => return Ok(msg),
    };

    let transfer_id = new_id();
    let subject = recv_subject(&msg, &transfer_id);
    let mut sub = bus
        .subscribe(&subject, &transfer_id, PendingLimits::default())
        .await?;
    debug!(
        target: TARGET,
        msgid = %msg.msg_id().unwrap_or_default(),
        pages,
        %subject,
        "reassembling chunked message"
    );

    let reply_to = msg
        .reply
        .take()
        .ok_or(ProtocolError::MissingReplySubject)?;
    let mut control = Message::empty(reply_to);
    control.headers = copy_protocol_headers(&msg);
    control.headers.set(HEADER_CHUNK_SUBJECT, transfer_id.as_str());
    bus.publish(control).await?;

    let mut data = BytesMut::from(&msg.payload[..]);
    for page in 1..=pages {
        let chunk = tokio::select! {
            chunk = sub.next() => chunk.ok_or(ProtocolError::Bus(BusError::Closed))?,
            _ = cancel.cancelled() => {
                debug!(target: TARGET, page, pages, "cancelled mid-transfer");
                return Err(ProtocolError::Cancelled);
            }
        };

        let seq = chunk
            .headers
            .get(HEADER_CHUNK_SEQ)
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or(ProtocolError::MissingChunkSeq)?;
        if seq != page {
            return Err(ProtocolError::ChunkOutOfOrder {
                expected: page,
                got: seq,
            });
        }

        data.extend_from_slice(&chunk.payload);
        if page < pages {
            let reply_to = chunk
                .reply
                .clone()
                .ok_or(ProtocolError::MissingReplySubject)?;
            let mut ack = Message::empty(reply_to);
            ack.headers = copy_protocol_headers(&chunk);
            bus.publish(ack).await?;
        } else {
            // The sender is waiting on the last chunk's inbox for the
            // logical reply.
            msg.reply = chunk.reply.clone();
        }
    }

    msg.payload = data.freeze();
    // The logical message is whole again; the chunk count must not leak
    // into replies built by copying its headers.
    msg.headers.remove(HEADER_CHUNKS);
    debug!(
        target: TARGET,
        msgid = %msg.msg_id().unwrap_or_default(),
        bytes = msg.payload.len(),
        "reassembly complete"
    );
    Ok(msg)
}

/// Bus request that honours cancellation.
async fn request(
    bus: &dyn Bus,
    cancel: &CancellationToken,
    msg: Message,
) -> Result<Message, ProtocolError> {
    tokio::select! {
        reply = bus.request(msg) => Ok(reply?),
        _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
    }
}

fn chunk_message(src: &Message, subject: &str, page: usize, size: usize) -> Message {
    let start = page * MAX_CHUNK_SIZE;
    let end = ((page + 1) * MAX_CHUNK_SIZE).min(size);
    let mut chunk = Message::empty(subject);
    chunk.headers = copy_protocol_headers(src);
    chunk.headers.set(HEADER_CHUNK_SEQ, page.to_string());
    chunk.payload = src.payload.slice(start..end);
    chunk
}

fn send_subject(msg: &Message, transfer_id: &str) -> String {
    match request_info(msg) {
        Some(nri) => format!("chunk.{}.send.{}", nri.acc, transfer_id),
        None => format!("chunk.send.{}", transfer_id),
    }
}

fn recv_subject(msg: &Message, transfer_id: &str) -> String {
    match request_info(msg) {
        Some(nri) => format!("chunk.{}.recv.{}", nri.acc, transfer_id),
        None => format!("chunk.recv.{}", transfer_id),
    }
}
