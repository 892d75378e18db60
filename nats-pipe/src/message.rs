//! Protocol message framing.
//!
//! Every logical operation is carried by one or more bus messages tagged
//! with `X-RNS-*` headers. The transaction id (`X-RNS-MSGID`) is generated
//! once per logical operation and copied verbatim onto every chunk that
//! belongs to it; replies are matched by inbox, so the id exists purely for
//! tracing and correlation in logs.

use bytes::Bytes;
use rand::Rng;
use serde::Deserialize;

/// Transaction id, present on every message that carries data.
pub const HEADER_MSG_ID: &str = "X-RNS-MSGID";
/// Operation name ("open", "save", ...). Set on the initial message.
pub const HEADER_OPERATION: &str = "X-RNS-OP";
/// Number of follow-on chunks. Present only on the initial message of a
/// chunked transfer; absent or empty means single-shot.
pub const HEADER_CHUNKS: &str = "X-RNS-CHUNKS";
/// Transfer id returned by the receiver on the control reply of an initial
/// chunk. Steers all follow-on chunks onto the negotiated chunk subject.
pub const HEADER_CHUNK_SUBJECT: &str = "X-RNS-CHUNK-SUBJECT";
/// 1-based sequence number on each follow-on chunk.
pub const HEADER_CHUNK_SEQ: &str = "X-RNS-CHUNKS-SEQ";
/// Server-injected request info (JSON), carries the account name used to
/// prefix chunk subjects on multi-account servers.
pub const HEADER_REQUEST_INFO: &str = "Nats-Request-Info";

/// Length of a generated transaction or transfer id.
pub const ID_LEN: usize = 16;

const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Generate a fresh 16-character alphanumeric id.
///
/// 52^16 distinct values; collisions are not a practical concern even at
/// thousands of transactions per second over a long process lifetime.
pub fn new_id() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_LEN)
        .map(|_| LETTERS[rng.gen_range(0..LETTERS.len())] as char)
        .collect()
}

/// Ordered string header map.
///
/// Values are ASCII strings. This type is owned by the protocol layer and
/// converted to the bus client's native header representation at the edge,
/// so bus-internal headers never leak into protocol logic by accident.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value for `name`, or None. Exact (case-sensitive) match.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set `name` to `value`, replacing any previous value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    /// Remove `name` if present.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| n != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A bus message: subject, optional reply-to inbox, headers, opaque payload.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub subject: String,
    pub reply: Option<String>,
    pub headers: Headers,
    pub payload: Bytes,
}

impl Message {
    /// New message opening a logical transaction: carries a fresh
    /// transaction id.
    pub fn new(subject: impl Into<String>) -> Self {
        let mut msg = Self::empty(subject);
        msg.headers.set(HEADER_MSG_ID, new_id());
        msg
    }

    /// New message without a transaction id. Chunks, acks, and control
    /// replies copy the id from the message they belong to instead of
    /// generating their own.
    pub fn empty(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            reply: None,
            headers: Headers::new(),
            payload: Bytes::new(),
        }
    }

    /// The transaction id, if set and non-empty.
    pub fn msg_id(&self) -> Option<&str> {
        self.headers.get(HEADER_MSG_ID).filter(|v| !v.is_empty())
    }
}

/// Copy exactly the protocol headers (`MSGID`, `CHUNKS`, `OP`) from `src`.
///
/// Bus-internal headers are deliberately not propagated.
pub fn copy_protocol_headers(src: &Message) -> Headers {
    let mut headers = Headers::new();
    for name in [HEADER_MSG_ID, HEADER_CHUNKS, HEADER_OPERATION] {
        if let Some(value) = src.headers.get(name) {
            if !value.is_empty() {
                headers.set(name, value);
            }
        }
    }
    headers
}

/// Parsed `Nats-Request-Info` header.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestInfo {
    pub acc: String,
    #[serde(default)]
    pub rtt: i64,
}

/// Request info injected by the server, if present and well-formed.
pub fn request_info(msg: &Message) -> Option<RequestInfo> {
    let raw = msg.headers.get(HEADER_REQUEST_INFO)?;
    serde_json::from_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_id_shape() {
        let id = new_id();
        assert_eq!(id.len(), ID_LEN);
        assert!(id.bytes().all(|b| b.is_ascii_alphabetic()));
    }

    #[test]
    fn test_id_uniqueness() {
        let mut seen = HashSet::new();
        for _ in 0..100_000 {
            assert!(seen.insert(new_id()), "duplicate transaction id");
        }
    }

    #[test]
    fn test_new_message_carries_id() {
        let msg = Message::new("repo.commands.open");
        assert!(msg.msg_id().is_some());
        assert!(Message::empty("x").msg_id().is_none());
    }

    #[test]
    fn test_copy_protocol_headers_exact_set() {
        let mut msg = Message::new("subj");
        msg.headers.set(HEADER_OPERATION, "save");
        msg.headers.set(HEADER_CHUNKS, "3");
        msg.headers.set(HEADER_CHUNK_SEQ, "1");
        msg.headers.set("Nats-Expected-Stream", "internal");

        let copied = copy_protocol_headers(&msg);
        assert_eq!(copied.get(HEADER_MSG_ID), msg.headers.get(HEADER_MSG_ID));
        assert_eq!(copied.get(HEADER_OPERATION), Some("save"));
        assert_eq!(copied.get(HEADER_CHUNKS), Some("3"));
        assert_eq!(copied.get(HEADER_CHUNK_SEQ), None);
        assert_eq!(copied.get("Nats-Expected-Stream"), None);
    }

    #[test]
    fn test_request_info_parsing() {
        let mut msg = Message::empty("subj");
        assert!(request_info(&msg).is_none());

        msg.headers
            .set(HEADER_REQUEST_INFO, r#"{"acc":"tenant1","rtt":42}"#);
        let nri = request_info(&msg).expect("parsed");
        assert_eq!(nri.acc, "tenant1");
        assert_eq!(nri.rtt, 42);

        msg.headers.set(HEADER_REQUEST_INFO, "not json");
        assert!(request_info(&msg).is_none());
    }
}
