//! Tunnelled HTTP request/response payloads

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// HTTP request replayed against the local web service
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequestMessage {
    #[serde(alias = "Method")]
    pub method: String,

    #[serde(alias = "Path")]
    pub path: String,

    /// Base64 encoded body
    #[serde(default, alias = "Body")]
    pub body: Option<String>,

    #[serde(default, alias = "Headers")]
    pub headers: Option<HashMap<String, String>>,
}

impl CommandRequestMessage {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            body: None,
            headers: None,
        }
    }

    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = Some(STANDARD.encode(body));
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(name.into(), value.into());
        self
    }

    /// Decoded body bytes; `Ok(None)` when there is no body
    pub fn body_bytes(&self) -> Result<Option<Vec<u8>>, base64::DecodeError> {
        self.body.as_deref().map(|b| STANDARD.decode(b)).transpose()
    }
}

/// Response captured from the local web service
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponseMessage {
    #[serde(alias = "StatusCode")]
    pub status_code: u16,

    /// Base64 encoded body
    #[serde(default, alias = "Body")]
    pub body: Option<String>,

    #[serde(default, alias = "Headers")]
    pub headers: Option<HashMap<String, String>>,
}

impl CommandResponseMessage {
    pub fn new(status_code: u16, body: &[u8], headers: HashMap<String, String>) -> Self {
        Self {
            status_code,
            body: (!body.is_empty()).then(|| STANDARD.encode(body)),
            headers: (!headers.is_empty()).then_some(headers),
        }
    }

    pub fn body_bytes(&self) -> Option<Vec<u8>> {
        self.body.as_deref().and_then(|b| STANDARD.decode(b).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_encoding() {
        let request = CommandRequestMessage::new("POST", "/api/v1/backups")
            .with_body(b"{\"id\":1}")
            .with_header("Content-Type", "application/json");

        assert_eq!(request.body.as_deref(), Some("eyJpZCI6MX0="));
        assert_eq!(request.body_bytes().unwrap().unwrap(), b"{\"id\":1}");
        assert_eq!(
            request.headers.as_ref().unwrap().get("Content-Type").unwrap(),
            "application/json"
        );
    }

    #[test]
    fn test_request_wire_shape() {
        let raw = r#"{"Method":"GET","Path":"/api/v1/serverstate"}"#;
        let request: CommandRequestMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.body_bytes(), Ok(None));
        assert_eq!(request.headers, None);
    }

    #[test]
    fn test_request_body_not_base64() {
        let raw = r#"{"method":"POST","path":"/api/v1/backups","body":"%%%not-base64%%%"}"#;
        let request: CommandRequestMessage = serde_json::from_str(raw).unwrap();
        assert!(request.body_bytes().is_err());
    }

    #[test]
    fn test_response_empty_body() {
        let response = CommandResponseMessage::new(204, b"", HashMap::new());
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains(r#""statusCode":204"#));
        assert_eq!(response.body, None);
        assert_eq!(response.headers, None);
    }
}
