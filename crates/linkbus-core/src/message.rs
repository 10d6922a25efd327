//! Wire messages exchanged with links
//!
//! Messages are JSON objects. Outgoing frames wrap either a batch of
//! requests (`{"requests": [...]}`) or a batch of responses
//! (`{"responses": [...]}`).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::RequestId;

/// Tag of the full-resync diff entry
pub const IS_TAG: &str = "$is";

/// Tag of the synthetic entry pointing at the producer's node path
pub const BASE_TAG: &str = "$base";

/// Tag of the synthetic entry carrying a producer's link data
pub const LINK_DATA_TAG: &str = "$linkData";

/// Tag of the synthetic entry broadcast when a producer goes away
pub const DISCONNECTED_TS_TAG: &str = "$disconnectedTs";

/// `change` marker of a removal record
pub const REMOVE_CHANGE: &str = "remove";

/// Path of the tree root
pub const ROOT_PATH: &str = "/";

/// Whether `path` names the tree root
#[inline]
pub fn is_root(path: &str) -> bool {
    path == ROOT_PATH
}

/// Stream status carried by responses
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Initialize,
    Open,
    Closed,
}

impl StreamState {
    /// Wire name of the state
    pub fn json_name(self) -> &'static str {
        match self {
            StreamState::Initialize => "initialize",
            StreamState::Open => "open",
            StreamState::Closed => "closed",
        }
    }

    #[inline]
    pub fn is_closed(self) -> bool {
        self == StreamState::Closed
    }
}

/// Shape of a single entry inside an `updates` list
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffKind<'a> {
    /// `{"name": .., "change": "remove"}`
    Removal(&'a str),
    /// `[tag, ...fields]`
    Positional(&'a str),
    /// Anything else; forwarded untouched
    Unrecognized,
}

impl<'a> DiffKind<'a> {
    /// Classify an update entry
    pub fn of(entry: &'a Value) -> Self {
        match entry {
            Value::Object(obj) => {
                let change = obj.get("change").and_then(Value::as_str);
                match (obj.get("name").and_then(Value::as_str), change) {
                    (Some(name), Some(REMOVE_CHANGE)) => DiffKind::Removal(name),
                    _ => DiffKind::Unrecognized,
                }
            }
            Value::Array(row) => match row.first().and_then(Value::as_str) {
                Some(tag) => DiffKind::Positional(tag),
                None => DiffKind::Unrecognized,
            },
            _ => DiffKind::Unrecognized,
        }
    }
}

/// Build a positional diff entry `[tag, value]`
pub fn positional(tag: &str, value: impl Into<Value>) -> Value {
    Value::Array(vec![Value::String(tag.to_string()), value.into()])
}

/// A single response inside a `responses` frame
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updates: Option<Vec<Value>>,
    /// Fields this layer does not interpret (columns, error, meta...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResponseMessage {
    /// Response carrying only updates
    pub fn with_updates(updates: Vec<Value>) -> Self {
        ResponseMessage {
            updates: Some(updates),
            ..Default::default()
        }
    }

    pub fn stream(mut self, state: StreamState) -> Self {
        self.stream = Some(state);
        self
    }

    pub fn rid(mut self, rid: RequestId) -> Self {
        self.rid = Some(rid);
        self
    }
}

/// A single request inside a `requests` frame
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub rid: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RequestMessage {
    /// `list` request for a path
    pub fn list(rid: RequestId, path: &str) -> Self {
        RequestMessage {
            rid,
            method: Some("list".to_string()),
            path: Some(path.to_string()),
            extra: Map::new(),
        }
    }
}

/// Outgoing frame handed to the transport
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireMessage {
    Requests(Vec<RequestMessage>),
    Responses(Vec<ResponseMessage>),
}

impl WireMessage {
    /// Frame holding one response
    pub fn response(response: ResponseMessage) -> Self {
        WireMessage::Responses(vec![response])
    }

    /// Frame holding one request
    pub fn request(request: RequestMessage) -> Self {
        WireMessage::Requests(vec![request])
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Incoming frame from a link; either half may be absent
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub requests: Vec<RequestMessage>,
    #[serde(default)]
    pub responses: Vec<ResponseMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_entries() {
        let removal = json!({"name": "child", "change": "remove"});
        let update = json!({"name": "child", "change": "update"});
        let row = json!(["$is", "node"]);
        let untagged = json!([1, 2]);

        assert_eq!(DiffKind::of(&removal), DiffKind::Removal("child"));
        assert_eq!(DiffKind::of(&update), DiffKind::Unrecognized);
        assert_eq!(DiffKind::of(&row), DiffKind::Positional("$is"));
        assert_eq!(DiffKind::of(&untagged), DiffKind::Unrecognized);
        assert_eq!(DiffKind::of(&json!("text")), DiffKind::Unrecognized);
    }

    #[test]
    fn test_response_wire_shape() {
        let msg = ResponseMessage::with_updates(vec![json!(["$base", "/a"])])
            .stream(StreamState::Open)
            .rid(RequestId(10));
        let frame = WireMessage::response(msg).to_json();

        assert_eq!(
            frame,
            json!({"responses": [{"rid": 10, "stream": "open", "updates": [["$base", "/a"]]}]})
        );
    }

    #[test]
    fn test_response_keeps_unknown_fields() {
        let raw = json!({"rid": 3, "stream": "closed", "error": {"msg": "gone"}});
        let msg: ResponseMessage = serde_json::from_value(raw.clone()).unwrap();

        assert_eq!(msg.stream, Some(StreamState::Closed));
        assert!(msg.updates.is_none());
        assert_eq!(serde_json::to_value(&msg).unwrap(), raw);
    }

    #[test]
    fn test_list_request_shape() {
        let frame = WireMessage::request(RequestMessage::list(RequestId(1), "/sys")).to_json();
        assert_eq!(
            frame,
            json!({"requests": [{"rid": 1, "method": "list", "path": "/sys"}]})
        );
    }

    #[test]
    fn test_inbound_frame_defaults() {
        let frame: InboundFrame = serde_json::from_str(r#"{"responses": []}"#).unwrap();
        assert!(frame.requests.is_empty());
        assert!(frame.responses.is_empty());
    }
}
