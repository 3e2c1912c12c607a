//! Tunnelled commands and their replay against the local web service

use crate::config::WebServiceConfig;
use crate::error::{RemoteError, Result};
use async_trait::async_trait;
use remotectl_protocol::{CommandRequestMessage, CommandResponseMessage, Envelope};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use std::collections::HashMap;
use std::sync::Weak;
use tracing::{debug, warn};

/// Header carrying the pre-shared key expected by the local web service
pub const PRE_SHARED_KEY_HEADER: &str = "presharedkey";

/// Something that can put an envelope on the socket
#[async_trait]
pub(crate) trait EnvelopeSink: Send + Sync {
    /// Returns `Ok(false)` when the send gate is closed
    async fn send_envelope(&self, envelope: Envelope, force: bool) -> Result<bool>;
}

/// Sends the response to one command under its original message id
///
/// Holds the connection weakly; responding after the connection is gone
/// reports `false` instead of keeping it alive.
#[derive(Clone)]
pub struct Responder {
    sink: Weak<dyn EnvelopeSink>,
    request: Envelope,
}

impl Responder {
    pub(crate) fn new(sink: Weak<dyn EnvelopeSink>, request: Envelope) -> Self {
        Self { sink, request }
    }

    /// Message id the response will carry
    pub fn message_id(&self) -> &str {
        &self.request.message_id
    }

    pub async fn respond(&self, response: &CommandResponseMessage) -> Result<bool> {
        let Some(sink) = self.sink.upgrade() else {
            debug!("Connection gone, dropping response to {}", self.message_id());
            return Ok(false);
        };

        let envelope = self.request.respond_with(response, None)?;
        sink.send_envelope(envelope, false).await
    }
}

/// A command received from the management service
pub struct CommandMessage {
    request: CommandRequestMessage,
    responder: Responder,
}

impl CommandMessage {
    pub fn new(request: CommandRequestMessage, responder: Responder) -> Self {
        Self { request, responder }
    }

    pub fn request(&self) -> &CommandRequestMessage {
        &self.request
    }

    pub fn message_id(&self) -> &str {
        self.responder.message_id()
    }

    /// Send a response back; `false` if the connection is not authenticated
    pub async fn respond(&self, response: CommandResponseMessage) -> Result<bool> {
        self.responder.respond(&response).await
    }

    /// Replay the request against the local web service and respond
    ///
    /// `headers` are added to every request before the tunnelled ones.
    /// Response headers are reduced to their first value.
    pub async fn handle(
        &self,
        http: &reqwest::Client,
        base_url: &str,
        headers: &HeaderMap,
    ) -> Result<bool> {
        let response = self.replay(http, base_url, headers).await?;
        self.respond(response).await
    }

    async fn replay(
        &self,
        http: &reqwest::Client,
        base_url: &str,
        headers: &HeaderMap,
    ) -> Result<CommandResponseMessage> {
        let method = Method::from_bytes(self.request.method.to_ascii_uppercase().as_bytes())
            .map_err(|e| RemoteError::InvalidMessage(format!("bad method: {}", e)))?;
        let url = join_url(base_url, &self.request.path);

        debug!("Replaying {} {}", method, self.request.path);

        let mut builder = http.request(method, url).headers(headers.clone());
        if let Some(tunnelled) = &self.request.headers {
            for (name, value) in tunnelled {
                match (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    (Ok(name), Ok(value)) => builder = builder.header(name, value),
                    _ => warn!("Skipping invalid tunnelled header {}", name),
                }
            }
        }
        let body = self
            .request
            .body_bytes()
            .map_err(|e| RemoteError::InvalidMessage(format!("body is not base64: {}", e)))?;
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let response_headers = first_values(response.headers());
        let body = response.bytes().await?;

        Ok(CommandResponseMessage::new(status, &body, response_headers))
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn first_values(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .keys()
        .filter_map(|name| {
            let value = headers.get(name)?.to_str().ok()?;
            Some((name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

/// Headers added to every replayed request
pub fn webservice_headers(config: &WebServiceConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();

    if let Some(token) = config.bearer_token.as_deref().filter(|t| !t.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| RemoteError::InvalidState(format!("bearer token: {}", e)))?;
        headers.insert(AUTHORIZATION, value);
    }

    if let Some(key) = config.pre_shared_key.as_deref().filter(|k| !k.is_empty()) {
        let value = HeaderValue::from_str(key)
            .map_err(|e| RemoteError::InvalidState(format!("pre-shared key: {}", e)))?;
        headers.insert(HeaderName::from_static(PRE_SHARED_KEY_HEADER), value);
    }

    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Bytes;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::routing::post;
    use parking_lot::Mutex;
    use remotectl_protocol::wire_type;
    use std::sync::Arc;

    #[derive(Default)]
    struct CollectingSink {
        sent: Mutex<Vec<(Envelope, bool)>>,
    }

    #[async_trait]
    impl EnvelopeSink for CollectingSink {
        async fn send_envelope(&self, envelope: Envelope, force: bool) -> Result<bool> {
            self.sent.lock().push((envelope, force));
            Ok(true)
        }
    }

    fn request_envelope() -> Envelope {
        Envelope::new("server", "machine-1", wire_type::COMMAND)
    }

    #[test]
    fn test_join_url() {
        assert_eq!(
            join_url("http://127.0.0.1:8200/", "/api/v1/serverstate"),
            "http://127.0.0.1:8200/api/v1/serverstate"
        );
        assert_eq!(
            join_url("http://127.0.0.1:8200", "api/v1/backups"),
            "http://127.0.0.1:8200/api/v1/backups"
        );
    }

    #[test]
    fn test_webservice_headers() {
        let config = WebServiceConfig {
            bearer_token: Some("tok".to_string()),
            pre_shared_key: Some("psk".to_string()),
            ..Default::default()
        };
        let headers = webservice_headers(&config).unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok");
        assert_eq!(headers.get("PreSharedKey").unwrap(), "psk");

        assert!(webservice_headers(&WebServiceConfig::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_respond_keeps_message_id() {
        let sink = Arc::new(CollectingSink::default());
        let weak: Weak<dyn EnvelopeSink> = Arc::downgrade(&sink) as Weak<CollectingSink>;
        let request = request_envelope();

        let command = CommandMessage::new(
            CommandRequestMessage::new("GET", "/"),
            Responder::new(weak, request.clone()),
        );
        assert!(
            command
                .respond(CommandResponseMessage::new(204, b"", HashMap::new()))
                .await
                .unwrap()
        );

        let sent = sink.sent.lock();
        let (envelope, force) = &sent[0];
        assert!(!force);
        assert_eq!(envelope.message_id, request.message_id);
        assert_eq!(envelope.from, "machine-1");
        assert_eq!(envelope.to, "server");
        assert_eq!(envelope.message_type, wire_type::COMMAND);
    }

    #[tokio::test]
    async fn test_respond_after_connection_dropped() {
        let sink = Arc::new(CollectingSink::default());
        let weak: Weak<dyn EnvelopeSink> = Arc::downgrade(&sink) as Weak<CollectingSink>;
        drop(sink);

        let responder = Responder::new(weak, request_envelope());
        let sent = responder
            .respond(&CommandResponseMessage::new(200, b"", HashMap::new()))
            .await
            .unwrap();
        assert!(!sent);
    }

    #[tokio::test]
    async fn test_handle_replays_request() {
        async fn echo(headers: AxumHeaders, body: Bytes) -> (StatusCode, [(&'static str, String); 1], Bytes) {
            let psk = headers
                .get("presharedkey")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            (StatusCode::CREATED, [("x-psk", psk)], body)
        }

        let app = Router::new().route("/api/v1/echo", post(echo));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let sink = Arc::new(CollectingSink::default());
        let weak: Weak<dyn EnvelopeSink> = Arc::downgrade(&sink) as Weak<CollectingSink>;
        let command = CommandMessage::new(
            CommandRequestMessage::new("post", "/api/v1/echo").with_body(b"hello"),
            Responder::new(weak, request_envelope()),
        );

        let headers = webservice_headers(&WebServiceConfig {
            pre_shared_key: Some("secret".to_string()),
            ..Default::default()
        })
        .unwrap();

        let sent = command
            .handle(&reqwest::Client::new(), &format!("http://{}", addr), &headers)
            .await
            .unwrap();
        assert!(sent);

        let sent = sink.sent.lock();
        let response: CommandResponseMessage = sent[0].0.payload_as().unwrap();
        assert_eq!(response.status_code, 201);
        assert_eq!(response.body_bytes().unwrap(), b"hello");
        assert_eq!(response.headers.unwrap()["x-psk"], "secret");
    }

    #[tokio::test]
    async fn test_handle_rejects_undecodable_body() {
        let sink = Arc::new(CollectingSink::default());
        let weak: Weak<dyn EnvelopeSink> = Arc::downgrade(&sink) as Weak<CollectingSink>;
        let mut request = CommandRequestMessage::new("POST", "/api/v1/echo");
        request.body = Some("%%%not-base64%%%".to_string());
        let command = CommandMessage::new(request, Responder::new(weak, request_envelope()));

        // Never reaches the network
        let err = command
            .handle(&reqwest::Client::new(), "http://127.0.0.1:1", &HeaderMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::InvalidMessage(_)));
        assert!(sink.sent.lock().is_empty());
    }
}
