use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const NOTIFICATION_MESSAGE_TYPE: &str = "notification";

// Only the dispatch field; the full body is re-parsed by the handler that
// wins the dispatch.
#[derive(Debug, Deserialize)]
pub struct RequestHeader {
    #[serde(rename = "messageType", default)]
    pub message_type: String,
}

// `uaid` and `channelIDs` stay optional so an absent field is
// distinguishable from an empty one; the hello handler treats those
// differently.
#[derive(Debug, Deserialize)]
pub struct HelloRequest {
    #[serde(rename = "uaid")]
    pub device_id: Option<String>,
    #[serde(rename = "channelIDs")]
    pub channel_ids: Option<Vec<Value>>,
    #[serde(default)]
    pub connect: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RegisterRequest {
    #[serde(rename = "channelID", default)]
    pub channel_id: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterReply {
    #[serde(rename = "messageType")]
    pub message_type: String,
    #[serde(rename = "uaid")]
    pub device_id: String,
    pub status: u16,
    #[serde(rename = "channelID")]
    pub channel_id: String,
    #[serde(rename = "pushEndpoint")]
    pub push_endpoint: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct UnregisterRequest {
    #[serde(rename = "channelID", default)]
    pub channel_id: String,
}

#[derive(Debug, Serialize)]
pub struct UnregisterReply {
    #[serde(rename = "messageType")]
    pub message_type: String,
    pub status: u16,
    #[serde(rename = "channelID")]
    pub channel_id: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Update {
    #[serde(rename = "channelID")]
    pub channel_id: String,
    #[serde(default)]
    pub version: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct AckRequest {
    #[serde(rename = "update", default)]
    pub updates: Vec<Update>,
    #[serde(default)]
    pub expired: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct FlushReply {
    #[serde(rename = "messageType")]
    pub message_type: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<Update>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub expired: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct PingReply {
    #[serde(rename = "messageType")]
    pub message_type: String,
    pub status: u16,
}
