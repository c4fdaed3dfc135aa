//! Messages and stream identities handled by the ingest buffer.
//!
//! ## Data flow
//!
//! **Consumer**: [`Message`] -> [`StreamKey`] + [`Message`].
//!
//! **Enqueue**: [`Message`] -> sized entry in the stream's buffer.
//!
//! **Flush workers**: buffered entries -> `Vec<Message>` batches, in insertion order.
use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of a stream in the configured catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamDescriptor {
    /// The namespace the stream belongs to, if any.
    #[serde(default)]
    pub namespace: Option<String>,
    /// The stream name.
    pub name: String,
}

/// The key used to partition buffered messages.
///
/// Unscoped checkpoints are buffered under [`StreamKey::Global`], which is not
/// tied to any catalog stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKey {
    Stream(StreamDescriptor),
    Global,
}

/// A message received from the upstream source.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A data record belonging to one stream.
    Record(RecordMessage),
    /// A checkpoint marker, scoped to one stream or global.
    Checkpoint(CheckpointMessage),
    /// Any other message kind. Not buffered.
    Other(OtherMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordMessage {
    pub stream: StreamDescriptor,
    pub data: Value,
    /// Emission time in milliseconds since the unix epoch, if the source sent one.
    pub emitted_at: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMessage {
    pub scope: StreamKey,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OtherMessage {
    pub kind: String,
    pub data: Value,
}

impl StreamDescriptor {
    pub fn new(namespace: Option<impl Into<String>>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.map(Into::into),
            name: name.into(),
        }
    }

    /// Creates a descriptor for a stream without a namespace.
    pub fn unscoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl StreamKey {
    /// Returns the stream descriptor, or `None` for the global key.
    pub fn descriptor(&self) -> Option<&StreamDescriptor> {
        match self {
            StreamKey::Stream(descriptor) => Some(descriptor),
            StreamKey::Global => None,
        }
    }

    pub fn is_global(&self) -> bool {
        matches!(self, StreamKey::Global)
    }
}

impl Message {
    /// Creates a record message with no emission time.
    pub fn record(stream: StreamDescriptor, data: Value) -> Self {
        Message::Record(RecordMessage {
            stream,
            data,
            emitted_at: None,
        })
    }

    /// Creates a checkpoint scoped to a single stream.
    pub fn stream_checkpoint(stream: StreamDescriptor, data: Value) -> Self {
        Message::Checkpoint(CheckpointMessage {
            scope: StreamKey::Stream(stream),
            data,
        })
    }

    /// Creates a checkpoint that is not tied to any stream.
    pub fn global_checkpoint(data: Value) -> Self {
        Message::Checkpoint(CheckpointMessage {
            scope: StreamKey::Global,
            data,
        })
    }

    pub fn as_record(&self) -> Option<&RecordMessage> {
        match self {
            Message::Record(record) => Some(record),
            _ => None,
        }
    }

    pub fn as_checkpoint(&self) -> Option<&CheckpointMessage> {
        match self {
            Message::Checkpoint(checkpoint) => Some(checkpoint),
            _ => None,
        }
    }
}

impl From<StreamDescriptor> for StreamKey {
    fn from(descriptor: StreamDescriptor) -> Self {
        StreamKey::Stream(descriptor)
    }
}

impl Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(namespace) => write!(f, "{}.{}", namespace, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKey::Stream(descriptor) => descriptor.fmt(f),
            StreamKey::Global => write!(f, "GLOBAL"),
        }
    }
}
