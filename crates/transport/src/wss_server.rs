//! WebSocket acceptor, used by the management-service side of the channel

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum WssServerError {
    #[error("Bind failed: {0}")]
    BindFailed(String),

    #[error("Accept failed: {0}")]
    AcceptFailed(String),

    #[error("Upgrade failed: {0}")]
    UpgradeFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),
}

/// WebSocket server configuration
#[derive(Debug, Clone)]
pub struct WssServerConfig {
    /// Bind address
    pub bind: SocketAddr,
}

impl Default for WssServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }
}

/// WebSocket server
pub struct WssServer {
    listener: TcpListener,
}

impl WssServer {
    /// Create a new WebSocket server
    pub async fn bind(config: WssServerConfig) -> Result<Self, WssServerError> {
        let listener = TcpListener::bind(config.bind)
            .await
            .map_err(|e| WssServerError::BindFailed(e.to_string()))?;

        info!("WebSocket server listening on {}", config.bind);

        Ok(Self { listener })
    }

    /// Get the bound address
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept the next connection and complete the upgrade
    pub async fn accept(&self) -> Result<(WssServerConnection, SocketAddr), WssServerError> {
        let (tcp, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| WssServerError::AcceptFailed(e.to_string()))?;

        let stream = accept_async(tcp)
            .await
            .map_err(|e| WssServerError::UpgradeFailed(e.to_string()))?;

        debug!("Accepted WebSocket connection from {}", peer);
        Ok((WssServerConnection { stream }, peer))
    }
}

/// One accepted connection
pub struct WssServerConnection {
    stream: WebSocketStream<TcpStream>,
}

impl WssServerConnection {
    pub async fn send_text(&mut self, text: &str) -> Result<(), WssServerError> {
        self.stream
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(|e| WssServerError::SendFailed(e.to_string()))
    }

    /// Next text frame; `None` once the peer goes away
    pub async fn receive_text(&mut self) -> Option<String> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(text.as_str().to_string()),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    }

    pub async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{WssClient, WssClientConfig};

    #[tokio::test]
    async fn test_text_exchange() {
        let server = WssServer::bind(WssServerConfig::default()).await.unwrap();
        let addr = server.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut conn, _) = server.accept().await.unwrap();
            let text = conn.receive_text().await.unwrap();
            conn.send_text(&format!("echo:{}", text)).await.unwrap();
            conn.close().await;
        });

        let mut client = WssClient::connect(WssClientConfig {
            url: format!("ws://{}/ws", addr),
            ..Default::default()
        })
        .await
        .unwrap();

        client.send_text("hello").await.unwrap();
        assert_eq!(client.receive_text().await.unwrap().as_deref(), Some("echo:hello"));
        assert_eq!(client.receive_text().await.unwrap(), None);

        accept.await.unwrap();
    }
}
