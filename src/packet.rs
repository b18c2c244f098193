use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, RouterError};

/// Publish arguments for one hop: an exchange plus a routing key, each
/// eligible for `%%field%%` macro substitution (§4.3.1) before publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishArgs {
    pub exchange: String,
    pub routing_key: String,
}

/// Per-class retry bookkeeping. The spec keeps both a running counter and a
/// history trail; we preserve both rather than picking one (§9 open question).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub retry_count: u32,
    pub retry_history: Vec<String>,
}

/// Structured error set on abort, carried in `settings.sito_return`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SitoReturn {
    pub code: String,
    pub description: String,
}

/// Router-managed metadata threaded alongside the cargo payload.
///
/// Known fields are first-class; anything the settings store or a stage adds
/// that the router doesn't know about lands in `extras` instead of being
/// dropped on re-encode (the "packet as untyped map" design note, §9).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub process_route: Vec<String>,
    #[serde(default)]
    pub history: Vec<String>,
    #[serde(default)]
    pub route_args: HashMap<String, PublishArgs>,
    #[serde(default)]
    pub record_id: Option<String>,
    #[serde(default)]
    pub task_start: Option<i64>,
    #[serde(default)]
    pub retry_ready: bool,
    #[serde(default)]
    pub retry_state: HashMap<String, RetryState>,
    #[serde(default)]
    pub sito_return: Option<SitoReturn>,
    #[serde(default)]
    pub request_status: Option<String>,
    #[serde(default)]
    pub request_status_detail: Option<String>,
    #[serde(default)]
    pub abort_status: Option<String>,
    #[serde(default)]
    pub abort_route: Option<Vec<String>>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub system_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub request_mode: Option<String>,
    #[serde(default)]
    pub fallback_mode: Option<String>,
    #[serde(default)]
    pub sent_time: Option<i64>,
    #[serde(default)]
    pub expires: Option<i64>,
    #[serde(default, flatten)]
    pub extras: Map<String, Value>,
}

/// The single unit that flows end-to-end: opaque cargo plus router-managed
/// settings. Ownership transfers to the broker between hops; within one
/// `RouterCore` invocation the router owns it outright (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePacket {
    pub cargo: Value,
    pub settings: Settings,
}

impl MessagePacket {
    pub fn new(cargo: Value, settings: Settings) -> Self {
        Self { cargo, settings }
    }

    /// Serializes the packet under the configured top-level key names
    /// (defaults `"cargo"` / `"settings"`, §6).
    pub fn encode(&self, cargo_key: &str, settings_key: &str) -> Result<Vec<u8>> {
        let mut obj = Map::new();
        obj.insert(cargo_key.to_string(), self.cargo.clone());
        let settings_value = serde_json::to_value(&self.settings)
            .map_err(|e| RouterError::JsonEncodeError(e.to_string()))?;
        obj.insert(settings_key.to_string(), settings_value);
        serde_json::to_vec(&Value::Object(obj))
            .map_err(|e| RouterError::JsonEncodeError(e.to_string()))
    }

    pub fn decode(bytes: &[u8], cargo_key: &str, settings_key: &str) -> Result<Self> {
        let mut value: Value = serde_json::from_slice(bytes)
            .map_err(|e| RouterError::JsonDecodeError(e.to_string()))?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| RouterError::JsonDecodeError("payload is not a JSON object".into()))?;
        let cargo = obj.remove(cargo_key).unwrap_or(Value::Null);
        let settings_value = obj.remove(settings_key).unwrap_or(Value::Object(Map::new()));
        let settings: Settings = serde_json::from_value(settings_value)
            .map_err(|e| RouterError::JsonDecodeError(e.to_string()))?;
        Ok(Self { cargo, settings })
    }

    /// Validates invariant 1 (§3): `history` must be a prefix-matching trace
    /// of `process_route`, allowing a class to repeat when it repeats in the
    /// route. Delegates to the same position logic `get_next_class` uses so
    /// the two never disagree.
    pub fn history_matches_route(&self) -> bool {
        crate::router::replay_history(&self.settings.history, &self.settings.process_route).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MessagePacket {
        let mut settings = Settings::default();
        settings.process_route = vec!["A".into(), "B".into(), "C".into()];
        settings.history = vec!["A".into()];
        settings.record_id = Some("req-1".into());
        settings.retry_ready = true;
        settings
            .retry_state
            .insert("B".into(), RetryState { retry_count: 1, retry_history: vec!["B".into()] });
        settings.extras.insert("custom_field".into(), Value::String("x".into()));
        MessagePacket::new(Value::String("hello".into()), settings)
    }

    #[test]
    fn round_trip_preserves_known_and_extra_fields() {
        let pkt = sample();
        let bytes = pkt.encode("cargo", "settings").unwrap();
        let decoded = MessagePacket::decode(&bytes, "cargo", "settings").unwrap();
        assert_eq!(pkt, decoded);
    }

    #[test]
    fn round_trip_honors_configured_key_names() {
        let pkt = sample();
        let bytes = pkt.encode("payload", "meta").unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains("\"payload\""));
        assert!(text.contains("\"meta\""));
        let decoded = MessagePacket::decode(&bytes, "payload", "meta").unwrap();
        assert_eq!(pkt, decoded);
    }

    #[test]
    fn decode_rejects_non_object_payload() {
        let err = MessagePacket::decode(b"\"not an object\"", "cargo", "settings").unwrap_err();
        assert!(matches!(err, RouterError::JsonDecodeError(_)));
    }
}
