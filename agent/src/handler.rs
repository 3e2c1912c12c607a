//! Default connection handler of the agent binary

use crate::command::{CommandMessage, webservice_headers};
use crate::config::WebServiceConfig;
use crate::connection::RemoteHandler;
use crate::error::Result;
use crate::settings::AgentSettings;
use async_trait::async_trait;
use remotectl_protocol::{ClaimedClientData, CommandResponseMessage};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Replays commands against the local web service and persists rekeys
pub struct WebServiceHandler {
    http: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
    settings: Mutex<AgentSettings>,
}

impl WebServiceHandler {
    pub fn new(config: &WebServiceConfig, settings: AgentSettings) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base_url: config.base_url.clone(),
            headers: webservice_headers(config)?,
            settings: Mutex::new(settings),
        })
    }

    pub async fn settings(&self) -> AgentSettings {
        self.settings.lock().await.clone()
    }
}

#[async_trait]
impl RemoteHandler for WebServiceHandler {
    async fn on_command(&self, command: CommandMessage) {
        match command.handle(&self.http, &self.base_url, &self.headers).await {
            Ok(true) => {}
            Ok(false) => warn!("Response to {} was not sent", command.message_id()),
            Err(e) => {
                warn!("Command {} failed: {}", command.message_id(), e);
                let response = CommandResponseMessage::new(
                    StatusCode::BAD_GATEWAY.as_u16(),
                    e.to_string().as_bytes(),
                    HashMap::new(),
                );
                if let Err(e) = command.respond(response).await {
                    warn!("Failed to report command failure: {}", e);
                }
            }
        }
    }

    async fn on_rekey(&self, credentials: ClaimedClientData) {
        let mut settings = self.settings.lock().await;
        if !settings.apply_rekey(&credentials) {
            return;
        }

        match settings.save().await {
            Ok(()) => info!("Saved updated credentials to {}", settings.path().display()),
            Err(e) => error!("Failed to save updated credentials: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use remotectl_protocol::MiniServerCertificate;

    #[tokio::test]
    async fn test_rekey_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = AgentSettings::load(&path).await.unwrap();

        let handler = WebServiceHandler::new(&WebServiceConfig::default(), settings).unwrap();
        handler
            .on_rekey(ClaimedClientData {
                jwt: "jwt-rotated".to_string(),
                server_url: "wss://example.com/ws".to_string(),
                certificate_url: String::new(),
                server_certificates: vec![MiniServerCertificate {
                    public_key_hash: "h1".to_string(),
                    public_key_pem: "-----BEGIN PUBLIC KEY-----".to_string(),
                    obtained: Utc::now(),
                    expiry: Utc::now() + TimeDelta::days(1),
                }],
                local_encryption_key: None,
            })
            .await;

        let reloaded = AgentSettings::load(&path).await.unwrap();
        assert_eq!(reloaded.jwt.as_deref(), Some("jwt-rotated"));
        assert_eq!(reloaded.server_certificates.len(), 1);
        assert_eq!(handler.settings().await.jwt.as_deref(), Some("jwt-rotated"));
    }
}
