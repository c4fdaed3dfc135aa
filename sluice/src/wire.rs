//! JSON-lines wire format.
//!
//! Every line is an object with a `type` field:
//!
//! ```text
//! {"type":"RECORD","record":{"namespace":"public","stream":"users","data":{"id":1},"emitted_at":1700000000000}}
//! {"type":"STATE","state":{"stream":{"namespace":"public","name":"users"},"data":{"cursor":1}}}
//! {"type":"STATE","state":{"data":{"cursor":1}}}
//! ```
//!
//! A `STATE` line without `stream` is a global checkpoint. Lines of any other
//! type are passed to the consumer as-is.
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sluice_ingest_core::{
    CheckpointMessage, Message, OtherMessage, RecordMessage, StreamDescriptor, StreamKey,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum TypedLine {
    Record { record: RecordLine },
    State { state: StateLine },
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordLine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    stream: String,
    #[serde(default)]
    data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    emitted_at: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StateLine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stream: Option<StreamDescriptor>,
    #[serde(default)]
    data: Value,
}

/// Parses one input line.
pub fn parse_message(line: &str) -> Result<Message, serde_json::Error> {
    let value: Value = serde_json::from_str(line)?;

    let kind = match value.get("type").and_then(Value::as_str) {
        Some("RECORD") | Some("STATE") => None,
        Some(kind) => Some(kind.to_string()),
        None => Some(String::new()),
    };

    if let Some(kind) = kind {
        return Ok(Message::Other(OtherMessage { kind, data: value }));
    }

    let message = match serde_json::from_value(value)? {
        TypedLine::Record { record } => Message::Record(RecordMessage {
            stream: StreamDescriptor {
                namespace: record.namespace,
                name: record.stream,
            },
            data: record.data,
            emitted_at: record.emitted_at,
        }),
        TypedLine::State { state } => Message::Checkpoint(CheckpointMessage {
            scope: state.stream.map(StreamKey::from).unwrap_or(StreamKey::Global),
            data: state.data,
        }),
    };

    Ok(message)
}

/// The line written to the stream output file for a record.
pub fn encode_record(record: &RecordMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(&RecordLine {
        namespace: record.stream.namespace.clone(),
        stream: record.stream.name.clone(),
        data: record.data.clone(),
        emitted_at: record.emitted_at,
    })
}

/// The acknowledgement written once a checkpoint is persisted.
pub fn encode_checkpoint(checkpoint: &CheckpointMessage) -> Result<String, serde_json::Error> {
    let state = StateLine {
        stream: checkpoint.scope.descriptor().cloned(),
        data: checkpoint.data.clone(),
    };

    serde_json::to_string(&json!({ "type": "STATE", "state": state }))
}
