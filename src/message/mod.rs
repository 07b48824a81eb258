//! This module contains the messages flowing through the storage node processing chain.
//!
//! Messages are typed but opaque to most of the chain. For ownership checks only a few fields matter:
//! the operation kind, the target [`Bucket`] (which carries its bucket space) and the index of the
//! distributor that sent the command (the claimed owner of the bucket).
//!
//! Every command has a [`MessageId`]. A reply always carries the id of the command it answers.
pub mod classifier;

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::{bucket::Bucket, cluster::state::ClusterStateBundle};

pub type MessageId = u64;

/// Every operation kind a storage node accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandKind {
    // external load
    Put,
    Update,
    Remove,
    Revert,
    Get,
    Visit,
    Stat,
    // bucket maintenance
    SplitBucket,
    JoinBuckets,
    MergeBuckets,
    RemoveLocation,
    SetBucketState,
    DeleteBucket,
    CreateBucket,
    RequestBucketInfo,
    GetBucketDiff,
    ApplyBucketDiff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResultCode {
    Ok,
    /// The operation was not executed. The sender should retry (possibly towards another node)
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnCode {
    pub code: ResultCode,
    pub message: String,
}

impl ReturnCode {
    pub fn ok() -> Self {
        Self {
            code: ResultCode::Ok,
            message: String::new(),
        }
    }

    pub fn new(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A command addressed to a bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageCommand {
    pub id: MessageId,
    pub kind: CommandKind,
    pub bucket: Bucket,
    /// Index of the distributor that sent this command
    pub source_index: u16,
    /// Operation specific payload. Never looked at by the ownership checks.
    #[serde(skip)]
    pub payload: Option<Bytes>,
}

impl StorageCommand {
    pub fn new(id: MessageId, kind: CommandKind, bucket: Bucket, source_index: u16) -> Self {
        Self {
            id,
            kind,
            bucket,
            source_index,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Creates a successful reply for this command
    pub fn make_reply(&self) -> StorageReply {
        StorageReply {
            id: self.id,
            kind: self.kind,
            bucket: self.bucket,
            result: ReturnCode::ok(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageReply {
    /// Id of the command this reply answers
    pub id: MessageId,
    pub kind: CommandKind,
    pub bucket: Bucket,
    pub result: ReturnCode,
}

/// Notification that a new cluster state must be applied by the node
#[derive(Debug, Clone, PartialEq)]
pub struct SetSystemState {
    pub id: MessageId,
    pub bundle: Arc<ClusterStateBundle>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StorageMessage {
    Command(StorageCommand),
    Reply(StorageReply),
    SetSystemState(SetSystemState),
}

impl StorageMessage {
    pub fn id(&self) -> MessageId {
        match self {
            StorageMessage::Command(cmd) => cmd.id,
            StorageMessage::Reply(reply) => reply.id,
            StorageMessage::SetSystemState(state) => state.id,
        }
    }
}

impl From<StorageCommand> for StorageMessage {
    fn from(cmd: StorageCommand) -> Self {
        Self::Command(cmd)
    }
}

impl From<StorageReply> for StorageMessage {
    fn from(reply: StorageReply) -> Self {
        Self::Reply(reply)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bytes::Bytes;

    use crate::bucket::{Bucket, BucketId, BucketSpace};

    use super::{CommandKind, ResultCode, StorageCommand, StorageMessage};

    #[test]
    fn reply_keeps_correlation() {
        let cmd = StorageCommand::new(
            42,
            CommandKind::Put,
            Bucket::new(BucketSpace::Default, BucketId::new(16, 4)),
            1,
        )
        .with_payload(Bytes::from("doc"));
        let reply = cmd.make_reply();

        assert_eq!(reply.id, 42);
        assert_eq!(reply.kind, CommandKind::Put);
        assert_eq!(reply.bucket, cmd.bucket);
        assert_eq!(reply.result.code, ResultCode::Ok);
        assert_eq!(StorageMessage::from(reply).id(), 42);
    }

    #[test]
    fn deserialize_command() {
        let cmd: StorageCommand = serde_json::from_str(
            r#"{"id": 7, "kind": "split_bucket", "bucket": {"space": "global", "id": {"used_bits": 16, "location": 4}}, "source_index": 0}"#,
        )
        .unwrap();

        assert_eq!(cmd.kind, CommandKind::SplitBucket);
        assert_eq!(cmd.bucket.space, BucketSpace::Global);
        assert_eq!(cmd.bucket.id, BucketId::new(16, 4));
        assert!(cmd.payload.is_none());
    }

    #[test]
    fn kind_names() {
        assert_eq!(CommandKind::RemoveLocation.to_string(), "remove_location");
        assert_eq!(
            CommandKind::from_str("join_buckets").unwrap(),
            CommandKind::JoinBuckets
        );
    }
}
