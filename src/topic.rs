//! Mapping between value identities and MQTT topics, and between value
//! models and MQTT payloads.
//!
//! Topic layout under a configurable prefix:
//!
//! ```text
//! {prefix}/{node}/{class}/{instance}/state    retained current value
//! {prefix}/{node}/{class}/{instance}/set      inbound commands
//! {prefix}/{node}/{class}/{instance}/result   command outcomes
//! {prefix}/{node}/status                      node lifecycle
//! {prefix}/bridge/status                      bridge availability (LWT)
//! ```

use crate::error::DecodeError;
use crate::model::{NodeId, Value, ValueClass, ValueId, ValueKind, ValueModel};
use chrono::SecondsFormat;
use serde_json::json;
use strum::{Display, EnumString};

/// Which side of a value a topic addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum Direction {
    #[strum(serialize = "state")]
    State,
    #[strum(serialize = "set")]
    Command,
}

pub const PAYLOAD_ONLINE: &str = "online";
pub const PAYLOAD_OFFLINE: &str = "offline";

#[derive(Debug, Clone)]
pub struct TopicMapper {
    prefix: String,
}

impl TopicMapper {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix: String = prefix.into();
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
        }
    }

    pub fn topic_for(&self, id: &ValueId, direction: Direction) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.prefix, id.node, id.class, id.instance, direction
        )
    }

    pub fn result_topic(&self, id: &ValueId) -> String {
        format!(
            "{}/{}/{}/{}/result",
            self.prefix, id.node, id.class, id.instance
        )
    }

    pub fn node_status_topic(&self, node: NodeId) -> String {
        format!("{}/{}/status", self.prefix, node)
    }

    pub fn bridge_status_topic(&self) -> String {
        format!("{}/bridge/status", self.prefix)
    }

    /// Wildcard filter covering every command topic.
    pub fn command_filter(&self) -> String {
        format!("{}/+/+/+/{}", self.prefix, Direction::Command)
    }

    /// Wildcard filter covering every state topic.
    pub fn state_filter(&self) -> String {
        format!("{}/+/+/+/{}", self.prefix, Direction::State)
    }

    /// Parse a value topic of either direction.
    pub fn parse_topic(&self, topic: &str) -> Option<(ValueId, Direction)> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let mut levels = rest.split('/');
        let node = levels.next()?.parse::<u8>().ok()?;
        let class = ValueClass::new(levels.next()?)?;
        let instance = levels.next()?.parse::<u8>().ok()?;
        let direction = levels.next()?.parse::<Direction>().ok()?;
        if levels.next().is_some() {
            return None;
        }
        Some((ValueId::new(NodeId(node), class, instance), direction))
    }

    /// Decode a command topic. Anything else is not for us.
    pub fn decode_topic(&self, topic: &str) -> Option<ValueId> {
        match self.parse_topic(topic)? {
            (id, Direction::Command) => Some(id),
            (_, Direction::State) => None,
        }
    }
}

/// Encode a value model as the JSON state payload.
pub fn encode_payload(model: &ValueModel) -> Vec<u8> {
    let mut payload = json!({
        "value": model.value.to_json(),
        "type": model.kind().to_string(),
        "timestamp": model.updated_at.to_rfc3339_opts(SecondsFormat::Millis, true),
    });
    if let Some(units) = &model.units {
        payload["units"] = json!(units);
    }
    payload.to_string().into_bytes()
}

/// Decode an inbound payload into a value of the expected kind.
///
/// Accepts the full state payload, a bare `{"value": ...}` object, a bare
/// JSON scalar, or plain unquoted text such as `ON`.
pub fn decode_payload(kind: ValueKind, payload: &[u8]) -> Result<Value, DecodeError> {
    let parsed = match serde_json::from_slice::<serde_json::Value>(payload) {
        Ok(parsed) => parsed,
        Err(e) => {
            let text = std::str::from_utf8(payload)
                .map_err(|_| DecodeError::InvalidJson(e.to_string()))?
                .trim();
            if text.is_empty() || text.starts_with('{') || text.starts_with('[') {
                return Err(DecodeError::InvalidJson(e.to_string()));
            }
            serde_json::Value::String(text.to_string())
        }
    };

    let raw = match parsed {
        serde_json::Value::Object(mut object) => {
            if let Some(tag) = object.get("type") {
                let matches = tag
                    .as_str()
                    .and_then(|t| t.parse::<ValueKind>().ok())
                    .is_some_and(|t| t == kind);
                if !matches {
                    return Err(DecodeError::TypeMismatch {
                        expected: kind.into(),
                        found: tag.to_string(),
                    });
                }
            }
            object.remove("value").ok_or(DecodeError::MissingValue)?
        }
        other => other,
    };

    scalar_to_value(kind, raw)
}

fn scalar_to_value(kind: ValueKind, raw: serde_json::Value) -> Result<Value, DecodeError> {
    use serde_json::Value as Json;

    let mismatch = |found: &Json| DecodeError::TypeMismatch {
        expected: kind.into(),
        found: json_type_name(found).to_string(),
    };

    if raw.is_null() {
        return Err(DecodeError::MissingValue);
    }

    match kind {
        ValueKind::Boolean => match &raw {
            Json::Bool(b) => Ok(Value::Boolean(*b)),
            Json::Number(n) => match n.as_f64() {
                Some(v) if v == 0.0 => Ok(Value::Boolean(false)),
                Some(v) if v == 1.0 => Ok(Value::Boolean(true)),
                _ => Err(mismatch(&raw)),
            },
            Json::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "on" | "1" => Ok(Value::Boolean(true)),
                "false" | "off" | "0" => Ok(Value::Boolean(false)),
                _ => Err(mismatch(&raw)),
            },
            _ => Err(mismatch(&raw)),
        },
        ValueKind::Numeric => {
            let number = match &raw {
                Json::Number(n) => n.as_f64().ok_or_else(|| mismatch(&raw))?,
                Json::String(s) => s.trim().parse::<f64>().map_err(|_| mismatch(&raw))?,
                _ => return Err(mismatch(&raw)),
            };
            if !number.is_finite() {
                return Err(DecodeError::NotFinite);
            }
            Ok(Value::Numeric(number))
        }
        ValueKind::Enumerated => match raw {
            Json::String(s) => Ok(Value::Enumerated(s)),
            other => Err(mismatch(&other)),
        },
        ValueKind::String => match raw {
            Json::String(s) => Ok(Value::String(s)),
            other => Err(mismatch(&other)),
        },
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ValueUpdate;

    fn mapper() -> TopicMapper {
        TopicMapper::new("zwave")
    }

    fn id(node: u8, class: &str, instance: u8) -> ValueId {
        ValueId::new(NodeId(node), ValueClass::new(class).unwrap(), instance)
    }

    fn model(value: Value) -> ValueModel {
        ValueModel::from_update(id(1, "x", 0), ValueUpdate::new(value, 1))
    }

    #[test]
    fn test_topics_are_deterministic() {
        let m = mapper();
        let target = id(12, "switch", 0);
        assert_eq!(m.topic_for(&target, Direction::State), "zwave/12/switch/0/state");
        assert_eq!(m.topic_for(&target, Direction::Command), "zwave/12/switch/0/set");
        assert_eq!(m.result_topic(&target), "zwave/12/switch/0/result");
        assert_eq!(m.node_status_topic(NodeId(12)), "zwave/12/status");
        assert_eq!(m.command_filter(), "zwave/+/+/+/set");
        assert_eq!(m.state_filter(), "zwave/+/+/+/state");
    }

    #[test]
    fn test_trailing_slash_in_prefix_is_ignored() {
        let m = TopicMapper::new("home/zwave/");
        assert_eq!(m.bridge_status_topic(), "home/zwave/bridge/status");
        assert_eq!(
            m.decode_topic("home/zwave/3/dimmer/1/set"),
            Some(id(3, "dimmer", 1))
        );
    }

    #[test]
    fn test_decode_topic_roundtrip() {
        let m = mapper();
        let target = id(200, "meter_2", 3);
        let topic = m.topic_for(&target, Direction::Command);
        assert_eq!(m.decode_topic(&topic), Some(target.clone()));
        assert_eq!(
            m.parse_topic(&m.topic_for(&target, Direction::State)),
            Some((target, Direction::State))
        );
    }

    #[test]
    fn test_decode_topic_ignores_foreign_topics() {
        let m = mapper();
        assert_eq!(m.decode_topic("zwave/12/switch/0/state"), None);
        assert_eq!(m.decode_topic("zwave/12/switch/0/result"), None);
        assert_eq!(m.decode_topic("zwave/bridge/status"), None);
        assert_eq!(m.decode_topic("zwave/300/switch/0/set"), None);
        assert_eq!(m.decode_topic("zwave/12/switch/x/set"), None);
        assert_eq!(m.decode_topic("zwave/12/switch/0/set/extra"), None);
        assert_eq!(m.decode_topic("zwavex/12/switch/0/set"), None);
        assert_eq!(m.decode_topic("other/12/switch/0/set"), None);
    }

    #[test]
    fn test_payload_roundtrip_for_every_kind() {
        let values = [
            Value::Boolean(true),
            Value::Boolean(false),
            Value::Numeric(0.1 + 0.2),
            Value::Numeric(-40.0),
            Value::Numeric(1e-300),
            Value::Enumerated("Heat".to_string()),
            Value::String("firmware 1.2 \"beta\"".to_string()),
        ];
        for value in values {
            let encoded = encode_payload(&model(value.clone()));
            assert_eq!(decode_payload(value.kind(), &encoded), Ok(value));
        }
    }

    #[test]
    fn test_encode_payload_fields() {
        let mut m = model(Value::Numeric(12.5));
        m.units = Some("W".to_string());
        let json: serde_json::Value = serde_json::from_slice(&encode_payload(&m)).unwrap();
        assert_eq!(json["value"], 12.5);
        assert_eq!(json["type"], "numeric");
        assert_eq!(json["units"], "W");
        assert!(json["timestamp"].is_string());

        let plain = model(Value::Boolean(true));
        let json: serde_json::Value = serde_json::from_slice(&encode_payload(&plain)).unwrap();
        assert!(json.get("units").is_none());
    }

    #[test]
    fn test_decode_payload_accepts_loose_forms() {
        assert_eq!(
            decode_payload(ValueKind::Boolean, br#"{"value": true}"#),
            Ok(Value::Boolean(true))
        );
        assert_eq!(decode_payload(ValueKind::Boolean, b"ON"), Ok(Value::Boolean(true)));
        assert_eq!(decode_payload(ValueKind::Boolean, b"0"), Ok(Value::Boolean(false)));
        assert_eq!(decode_payload(ValueKind::Numeric, b"42"), Ok(Value::Numeric(42.0)));
        assert_eq!(
            decode_payload(ValueKind::Numeric, br#"{"value": "17.5"}"#),
            Ok(Value::Numeric(17.5))
        );
        assert_eq!(
            decode_payload(ValueKind::Enumerated, br#""Cool""#),
            Ok(Value::Enumerated("Cool".to_string()))
        );
    }

    #[test]
    fn test_decode_payload_rejects_bad_input() {
        assert!(matches!(
            decode_payload(ValueKind::Boolean, br#"{"value": "maybe"}"#),
            Err(DecodeError::TypeMismatch { .. })
        ));
        assert_eq!(
            decode_payload(ValueKind::Boolean, br#"{"state": true}"#),
            Err(DecodeError::MissingValue)
        );
        assert!(matches!(
            decode_payload(ValueKind::Boolean, br#"{"value": true"#),
            Err(DecodeError::InvalidJson(_))
        ));
        assert!(matches!(
            decode_payload(ValueKind::Numeric, br#"{"value": 1, "type": "boolean"}"#),
            Err(DecodeError::TypeMismatch { .. })
        ));
        assert_eq!(
            decode_payload(ValueKind::Numeric, b"\"inf\""),
            Err(DecodeError::NotFinite)
        );
        assert_eq!(
            decode_payload(ValueKind::String, b"null"),
            Err(DecodeError::MissingValue)
        );
        assert!(decode_payload(ValueKind::Numeric, b"").is_err());
    }
}
