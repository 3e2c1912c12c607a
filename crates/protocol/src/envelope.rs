//! Envelope - The outer wrapper of every message on the socket

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),
}

/// Message types understood by the client
///
/// The wire `type` is an open string; anything not listed here decodes
/// to `Unknown` so new server message kinds never break the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Welcome,
    Auth,
    Pong,
    Command,
    Unknown,
}

impl MessageType {
    /// Classify a wire type string (case-insensitive)
    pub fn from_wire(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "welcome" => Self::Welcome,
            "auth" => Self::Auth,
            "pong" => Self::Pong,
            "command" => Self::Command,
            _ => Self::Unknown,
        }
    }
}

/// Wire type strings
pub mod wire_type {
    pub const WELCOME: &str = "welcome";
    pub const AUTH: &str = "auth";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const COMMAND: &str = "command";
}

/// Envelope for a single message
///
/// `message_id` is generated by the originator and echoed verbatim in
/// responses, so correlation never relies on socket ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub message_id: String,
    pub payload: Option<String>,
    pub error_message: Option<String>,
}

impl Envelope {
    /// Create an envelope with a fresh message id and no payload
    pub fn new(from: impl Into<String>, to: impl Into<String>, message_type: &str) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            message_type: message_type.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            payload: None,
            error_message: None,
        }
    }

    /// Parse an envelope from raw JSON
    ///
    /// Field names are matched case-insensitively. Every failure maps to
    /// `InvalidEnvelope`, never a raw deserializer error.
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| EnvelopeError::InvalidEnvelope(e.to_string()))?;

        let Value::Object(map) = value else {
            return Err(EnvelopeError::InvalidEnvelope(
                "envelope is not a JSON object".to_string(),
            ));
        };

        Ok(Self {
            from: required_string(&map, "from")?,
            to: required_string(&map, "to")?,
            message_type: required_string(&map, "type")?,
            message_id: required_string(&map, "messageId")?,
            payload: optional_string(&map, "payload")?,
            error_message: optional_string(&map, "errorMessage")?,
        })
    }

    /// Serialize to the wire representation
    pub fn to_json(&self) -> String {
        // A struct of strings cannot fail to serialize
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Classify the message type
    pub fn classify(&self) -> MessageType {
        MessageType::from_wire(&self.message_type)
    }

    /// Decode the payload into a typed message
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        let payload = self
            .payload
            .as_deref()
            .ok_or_else(|| EnvelopeError::InvalidEnvelope("missing payload".to_string()))?;

        serde_json::from_str(payload).map_err(|e| EnvelopeError::InvalidEnvelope(e.to_string()))
    }

    /// Attach a serialized payload
    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Result<Self, EnvelopeError> {
        let json = serde_json::to_string(payload)
            .map_err(|e| EnvelopeError::InvalidEnvelope(e.to_string()))?;
        self.payload = Some(json);
        Ok(self)
    }

    /// Build a response to this envelope
    ///
    /// `from`/`to` are swapped and the message id is kept; the type is kept
    /// unless overridden.
    pub fn respond_with<T: Serialize>(
        &self,
        payload: &T,
        message_type: Option<&str>,
    ) -> Result<Self, EnvelopeError> {
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
            message_type: message_type.unwrap_or(&self.message_type).to_string(),
            message_id: self.message_id.clone(),
            payload: None,
            error_message: None,
        }
        .with_payload(payload)
    }
}

fn find_field<'a>(map: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    map.get(name).or_else(|| {
        map.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    })
}

fn required_string(map: &Map<String, Value>, name: &str) -> Result<String, EnvelopeError> {
    match find_field(map, name) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(EnvelopeError::InvalidEnvelope(format!(
            "field '{}' is not a string",
            name
        ))),
        None => Err(EnvelopeError::InvalidEnvelope(format!(
            "missing field '{}'",
            name
        ))),
    }
}

fn optional_string(map: &Map<String, Value>, name: &str) -> Result<Option<String>, EnvelopeError> {
    match find_field(map, name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(EnvelopeError::InvalidEnvelope(format!(
            "field '{}' is not a string",
            name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuthMessage, WelcomeMessage};

    fn sample() -> Envelope {
        Envelope {
            from: "server".to_string(),
            to: "machine-1".to_string(),
            message_type: "welcome".to_string(),
            message_id: "42".to_string(),
            payload: Some(r#"{"serverPublicKeyHash":"abc"}"#.to_string()),
            error_message: None,
        }
    }

    #[test]
    fn test_parse_round_trip() {
        let envelope = sample();
        let parsed = Envelope::parse(&envelope.to_json()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_wire_field_names() {
        let json = sample().to_json();
        assert!(json.contains(r#""messageId":"42""#));
        assert!(json.contains(r#""type":"welcome""#));
        assert!(json.contains(r#""errorMessage":null"#));
    }

    #[test]
    fn test_parse_case_insensitive() {
        let raw = r#"{"From":"a","TO":"b","Type":"Command","MessageID":"7","Payload":null}"#;
        let envelope = Envelope::parse(raw).unwrap();
        assert_eq!(envelope.from, "a");
        assert_eq!(envelope.to, "b");
        assert_eq!(envelope.message_id, "7");
        assert_eq!(envelope.payload, None);
        assert_eq!(envelope.classify(), MessageType::Command);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            Envelope::parse("not json"),
            Err(EnvelopeError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            Envelope::parse("[1,2,3]"),
            Err(EnvelopeError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            Envelope::parse(r#"{"from":"a","to":"b","type":"auth"}"#),
            Err(EnvelopeError::InvalidEnvelope(_))
        ));
        assert!(matches!(
            Envelope::parse(r#"{"from":"a","to":"b","type":5,"messageId":"1"}"#),
            Err(EnvelopeError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_unknown_type() {
        let mut envelope = sample();
        envelope.message_type = "telemetry".to_string();
        assert_eq!(envelope.classify(), MessageType::Unknown);
    }

    #[test]
    fn test_payload_as() {
        let welcome: WelcomeMessage = sample().payload_as().unwrap();
        assert_eq!(welcome.server_public_key_hash, "abc");

        let mut missing = sample();
        missing.payload = None;
        assert!(missing.payload_as::<WelcomeMessage>().is_err());

        let mut broken = sample();
        broken.payload = Some("{".to_string());
        assert!(matches!(
            broken.payload_as::<WelcomeMessage>(),
            Err(EnvelopeError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_respond_with() {
        let request = sample();
        let auth = AuthMessage {
            token: "jwt".to_string(),
            public_key_pem: "pem".to_string(),
            client_version: "0.1.0".to_string(),
            protocol_version: 1,
        };

        let response = request.respond_with(&auth, Some(wire_type::AUTH)).unwrap();
        assert_eq!(response.from, "machine-1");
        assert_eq!(response.to, "server");
        assert_eq!(response.message_id, "42");
        assert_eq!(response.classify(), MessageType::Auth);

        let decoded: AuthMessage = response.payload_as().unwrap();
        assert_eq!(decoded, auth);

        let same_type = request.respond_with(&auth, None).unwrap();
        assert_eq!(same_type.message_type, "welcome");
    }

    #[test]
    fn test_new_generates_ids() {
        let a = Envelope::new("me", "server", wire_type::PING);
        let b = Envelope::new("me", "server", wire_type::PING);
        assert_ne!(a.message_id, b.message_id);
        assert_eq!(a.classify(), MessageType::Unknown);
    }
}
