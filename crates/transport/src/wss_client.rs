//! WebSocket client carrying text frames

use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async_with_config,
    tungstenite::{
        Error as WsError, Message,
        client::IntoClientRequest,
        http::{HeaderValue, Request, header},
        protocol::WebSocketConfig,
    },
};
use tracing::{debug, info, trace};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug)]
pub enum WssClientError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection timed out after {0:?}")]
    Timeout(Duration),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// WebSocket client configuration
#[derive(Debug, Clone)]
pub struct WssClientConfig {
    /// Target WebSocket URL
    pub url: String,

    /// User-Agent sent with the upgrade request
    pub user_agent: Option<String>,

    /// Connection timeout
    pub timeout: Duration,

    /// Largest accepted message
    pub max_message_size: usize,
}

impl Default for WssClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            user_agent: None,
            timeout: Duration::from_secs(30),
            max_message_size: 16 << 20, // 16MB
        }
    }
}

/// WebSocket client wrapper
pub struct WssClient {
    stream: WsStream,
}

impl WssClient {
    /// Connect to a WebSocket server
    pub async fn connect(config: WssClientConfig) -> Result<Self, WssClientError> {
        let request = Self::build_request(&config)?;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(config.max_message_size);
        ws_config.max_frame_size = Some(config.max_message_size);

        debug!("Connecting to {}", config.url);

        let (stream, response) = tokio::time::timeout(
            config.timeout,
            connect_async_with_config(request, Some(ws_config), false),
        )
        .await
        .map_err(|_| WssClientError::Timeout(config.timeout))?
        .map_err(|e| WssClientError::ConnectionFailed(e.to_string()))?;

        info!(
            "Connected to WebSocket server, status: {}",
            response.status()
        );

        Ok(Self { stream })
    }

    fn build_request(config: &WssClientConfig) -> Result<Request<()>, WssClientError> {
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| WssClientError::InvalidUrl(e.to_string()))?;

        if let Some(agent) = &config.user_agent {
            let value = HeaderValue::from_str(agent)
                .map_err(|e| WssClientError::InvalidUrl(e.to_string()))?;
            request.headers_mut().insert(header::USER_AGENT, value);
        }

        Ok(request)
    }

    /// Send a text message
    pub async fn send_text(&mut self, text: &str) -> Result<(), WssClientError> {
        send_text(&mut self.stream, text).await
    }

    /// Receive the next text message; `None` once the peer closes
    pub async fn receive_text(&mut self) -> Result<Option<String>, WssClientError> {
        receive_text(&mut self.stream).await
    }

    /// Close the connection
    pub async fn close(&mut self) -> Result<(), WssClientError> {
        debug!("Closing WebSocket connection");
        self.stream
            .close(None)
            .await
            .map_err(|e| WssClientError::SendFailed(e.to_string()))
    }

    /// Split into independently owned send and receive halves
    pub fn split(self) -> (WssSender, WssReceiver) {
        let (sink, stream) = self.stream.split();
        (WssSender { sink }, WssReceiver { stream })
    }
}

/// Sending half of a split client
pub struct WssSender {
    sink: SplitSink<WsStream, Message>,
}

impl WssSender {
    pub async fn send_text(&mut self, text: &str) -> Result<(), WssClientError> {
        send_text(&mut self.sink, text).await
    }

    pub async fn close(&mut self) -> Result<(), WssClientError> {
        self.sink
            .close()
            .await
            .map_err(|e| WssClientError::SendFailed(e.to_string()))
    }
}

/// Receiving half of a split client
pub struct WssReceiver {
    stream: SplitStream<WsStream>,
}

impl WssReceiver {
    /// Receive the next text message; `None` once the peer closes
    pub async fn receive_text(&mut self) -> Result<Option<String>, WssClientError> {
        receive_text(&mut self.stream).await
    }
}

async fn send_text<S>(sink: &mut S, text: &str) -> Result<(), WssClientError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    trace!("Sending text frame: {} bytes", text.len());
    sink.send(Message::Text(text.to_string().into()))
        .await
        .map_err(|e| WssClientError::SendFailed(e.to_string()))
}

/// Next text payload from either the whole stream or its receiving half
///
/// Control frames are answered by tungstenite and skipped here. Binary
/// frames are accepted when they hold UTF-8.
async fn receive_text<S>(stream: &mut S) -> Result<Option<String>, WssClientError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_string())),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => return Ok(Some(text)),
                Err(_) => {
                    debug!("Dropping non UTF-8 binary frame");
                    continue;
                }
            },
            Some(Ok(Message::Close(_))) | None => return Ok(None),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(WssClientError::ReceiveFailed(e.to_string())),
        }
    }
}
