//! CometBFT JSON-RPC payloads.
//!
//! Numeric fields are strings on the wire. They are kept as strings here and
//! parsed by the batch processor, so that a malformed block is reported for
//! its height instead of failing deserialization.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse<T> {
    pub result: Option<T>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl JsonRpcErrorObject {
    /// The node reports heights above its tip with an internal error.
    pub fn is_height_unavailable(&self) -> bool {
        let data = match &self.data {
            Some(Value::String(data)) => data.as_str(),
            _ => "",
        };

        [self.message.as_str(), data].iter().any(|text| {
            text.contains("must be less than or equal to the current blockchain height")
                || text.contains("could not find")
        })
    }
}

impl std::fmt::Display for JsonRpcErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.data {
            Some(data) => write!(f, "{} ({}): {}", self.message, self.code, data),
            None => write!(f, "{} ({})", self.message, self.code),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub sync_info: SyncInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncInfo {
    pub latest_block_height: String,
    #[serde(default)]
    pub latest_block_hash: String,
    #[serde(default)]
    pub catching_up: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockResponse {
    pub block_id: BlockId,
    pub block: Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockId {
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    #[serde(default)]
    pub data: BlockData,
    #[serde(default)]
    pub evidence: EvidenceList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Header {
    pub chain_id: String,
    pub height: String,
    pub time: String,
    #[serde(default)]
    pub proposer_address: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockData {
    /// Base64 encoded raw transactions.
    #[serde(default, deserialize_with = "null_as_default")]
    pub txs: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvidenceList {
    #[serde(default, deserialize_with = "null_as_default")]
    pub evidence: Vec<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockResultsResponse {
    pub height: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub txs_results: Vec<TxResult>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub begin_block_events: Vec<Event>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub end_block_events: Vec<Event>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub finalize_block_events: Vec<Event>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxResult {
    #[serde(default)]
    pub code: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub log: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub info: String,
    #[serde(default)]
    pub gas_wanted: Option<String>,
    #[serde(default)]
    pub gas_used: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub events: Vec<Event>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub codespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub attributes: Vec<EventAttribute>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventAttribute {
    pub key: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub value: String,
    #[serde(default)]
    pub index: bool,
}

/// A block together with its execution results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockWithResults {
    pub height: u64,
    pub block: BlockResponse,
    pub results: BlockResultsResponse,
}

impl Event {
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|attr| attr.key == key)
            .map(|attr| attr.value.as_str())
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{BlockResultsResponse, JsonRpcErrorObject, JsonRpcResponse, StatusResponse};

    #[test]
    fn test_null_collections_are_empty() {
        let results: BlockResultsResponse = serde_json::from_value(json!({
            "height": "10",
            "txs_results": null,
            "finalize_block_events": [
                { "type": "commission", "attributes": null }
            ]
        }))
        .unwrap();

        assert!(results.txs_results.is_empty());
        assert!(results.begin_block_events.is_empty());
        assert_eq!(results.finalize_block_events.len(), 1);
        assert!(results.finalize_block_events[0].attributes.is_empty());
    }

    #[test]
    fn test_height_unavailable_error() {
        let response: JsonRpcResponse<StatusResponse> = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {
                "code": -32603,
                "message": "Internal error",
                "data": "height 120 must be less than or equal to the current blockchain height 100"
            }
        }))
        .unwrap();

        assert!(response.result.is_none());
        assert!(response.error.unwrap().is_height_unavailable());

        let other = JsonRpcErrorObject {
            code: -32603,
            message: "Internal error".to_string(),
            data: Some(json!("timed out waiting for tx to be included in a block")),
        };
        assert!(!other.is_height_unavailable());
    }
}
