//! Typed repository commands.
//!
//! Seven commands, each with its own request and reply schema. The pairing
//! is carried in the type system: a request type names its reply type, so a
//! mismatched pair cannot be dispatched at all. Bodies travel
//! bincode-encoded; both ends of the wire agree on the encoding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Subject prefix all commands are dispatched on.
pub const COMMAND_SUBJECT_PREFIX: &str = "repo.commands.";

/// Full dispatch subject for the command named `name`.
pub fn command_subject(name: &str) -> String {
    format!("{COMMAND_SUBJECT_PREFIX}{name}")
}

/// A dispatchable repository command.
///
/// `NAME` is the operation name used in the dispatch subject and the
/// `X-RNS-OP` header.
pub trait Command: Serialize + Send + Sync {
    const NAME: &'static str;
    type Reply: DeserializeOwned + Send + 'static;
}

/// Open a repository bucket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenRequest {
    pub bucket: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OpenReply {
    pub ok: bool,
}

impl Command for OpenRequest {
    const NAME: &'static str = "open";
    type Reply = OpenReply;
}

/// Stat a file by full path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatRequest {
    pub bucket: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatReply {
    pub ok: bool,
    pub size: u64,
    pub name: String,
}

impl Command for StatRequest {
    const NAME: &'static str = "stat";
    type Reply = StatReply;
}

/// Create a directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MkdirRequest {
    pub bucket: String,
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MkdirReply {
    pub ok: bool,
}

impl Command for MkdirRequest {
    const NAME: &'static str = "mkdir";
    type Reply = MkdirReply;
}

/// Store a blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaveRequest {
    pub bucket: String,
    pub dir: String,
    pub name: String,
    pub filesize: u64,
    pub packet_size: u32,
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SaveReply {
    pub ok: bool,
}

impl Command for SaveRequest {
    const NAME: &'static str = "save";
    type Reply = SaveReply;
}

/// List files under a base directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListRequest {
    pub bucket: String,
    pub base_dir: String,
    /// Recurse into subdirectories.
    pub sub_dir: bool,
}

/// One list entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ListReply {
    pub ok: bool,
    pub entries: Vec<FileEntry>,
}

impl Command for ListRequest {
    const NAME: &'static str = "list";
    type Reply = ListReply;
}

/// Fetch a blob, or a slice of one when `length` is non-zero.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadRequest {
    pub bucket: String,
    pub dir: String,
    pub name: String,
    pub length: u32,
    pub offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoadReply {
    pub ok: bool,
    pub data: Vec<u8>,
}

impl Command for LoadRequest {
    const NAME: &'static str = "load";
    type Reply = LoadReply;
}

/// Remove a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoveRequest {
    pub bucket: String,
    pub dir: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoveReply {
    pub ok: bool,
}

impl Command for RemoveRequest {
    const NAME: &'static str = "remove";
    type Reply = RemoveReply;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_subjects() {
        assert_eq!(command_subject(OpenRequest::NAME), "repo.commands.open");
        assert_eq!(command_subject(SaveRequest::NAME), "repo.commands.save");
        assert_eq!(command_subject(RemoveRequest::NAME), "repo.commands.remove");
    }

    #[test]
    fn test_save_round_trip() {
        let req = SaveRequest {
            bucket: "tenant.repo".into(),
            dir: "data/ab".into(),
            name: "abcdef".into(),
            filesize: 7,
            packet_size: 7,
            offset: 0,
            data: b"payload".to_vec(),
        };
        let encoded = bincode::serialize(&req).unwrap();
        let decoded: SaveRequest = bincode::deserialize(&encoded).unwrap();
        assert_eq!(req, decoded);
    }

    #[test]
    fn test_list_reply_preserves_order() {
        let reply = ListReply {
            ok: true,
            entries: vec![
                FileEntry { name: "c".into(), size: 1 },
                FileEntry { name: "a".into(), size: 2 },
                FileEntry { name: "b".into(), size: 3 },
            ],
        };
        let decoded: ListReply =
            bincode::deserialize(&bincode::serialize(&reply).unwrap()).unwrap();
        let names: Vec<_> = decoded.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["c", "a", "b"]);
    }
}
