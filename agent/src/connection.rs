//! Remote connection runtime
//!
//! Keeps one authenticated socket to the management service alive. Three
//! refreshers run side by side:
//! - reconnect: purely signal driven, opens the socket
//! - heartbeat: checks liveness and pings the server
//! - certificate refresh: re-fetches the pinned server keys
//!
//! Each socket gets its own reader task. Frames are processed in arrival
//! order against the shared `Session`; commands are handed off to their
//! own tasks so several can be outstanding at once.

use crate::command::{CommandMessage, EnvelopeSink, Responder};
use crate::config::ConnectionConfig;
use crate::error::{RemoteError, Result};
use crate::refresher::{PeriodicRefresher, RefreshSignal};
use crate::session::{ConnectionState, FrameOutcome, Liveness, Session};
use crate::CLIENT_VERSION;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use remotectl_crypto::{ClientKeyPair, encrypt_message};
use remotectl_protocol::{
    ClaimedClientData, CommandRequestMessage, Envelope, MiniServerCertificate, usable_certificates,
    wire_type,
};
use remotectl_transport::{WssClient, WssClientConfig, WssReceiver, WssSender};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Recipient name used for client originated envelopes
const SERVER_ADDRESS: &str = "server";

/// Callbacks from the connection to its owner
#[async_trait]
pub trait RemoteHandler: Send + Sync + 'static {
    /// A command arrived; respond through `command.respond` or `command.handle`
    async fn on_command(&self, command: CommandMessage);

    /// Credentials changed; the owner decides how to persist them
    async fn on_rekey(&self, credentials: ClaimedClientData);
}

/// Connection timing and addressing
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Sender id on every outbound envelope
    pub machine_id: String,
    pub heartbeat_interval: Duration,
    pub reconnect_interval: Duration,
    pub certificate_refresh_interval: Duration,
    pub certificate_refresh_min_interval: Duration,
    pub connect_timeout: Duration,
}

impl ConnectionOptions {
    pub fn from_config(config: &ConnectionConfig, machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            reconnect_interval: Duration::from_secs(config.reconnect_interval_secs),
            certificate_refresh_interval: Duration::from_secs(
                config.certificate_refresh_interval_secs,
            ),
            certificate_refresh_min_interval: Duration::from_secs(
                config.certificate_refresh_min_secs,
            ),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from_config(&ConnectionConfig::default(), uuid::Uuid::new_v4().to_string())
    }
}

/// State shared by the loops, the reader and outstanding responders
struct Inner {
    session: Mutex<Session>,
    sink: tokio::sync::Mutex<Option<(u64, WssSender)>>,
    reader: Mutex<Option<AbortHandle>>,
    keys: ClientKeyPair,
    client_public_key_pem: String,
    options: ConnectionOptions,
    handler: Arc<dyn RemoteHandler>,
    http: reqwest::Client,
    reconnect: RefreshSignal,
    certificate_refresh: RefreshSignal,
    cancel: CancellationToken,
}

/// A long-lived, self-healing connection to the management service
pub struct RemoteConnection {
    inner: Arc<Inner>,
}

impl RemoteConnection {
    /// Create a connection with a freshly generated client key pair
    pub fn new(
        credentials: ClaimedClientData,
        handler: Arc<dyn RemoteHandler>,
        options: ConnectionOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let keys = ClientKeyPair::generate()?;
        Self::with_key_pair(credentials, keys, handler, options, cancel)
    }

    /// Create a connection that announces the given key pair
    pub fn with_key_pair(
        credentials: ClaimedClientData,
        keys: ClientKeyPair,
        handler: Arc<dyn RemoteHandler>,
        options: ConnectionOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let client_public_key_pem = keys.public_key_pem()?;
        let http = reqwest::Client::builder()
            .user_agent(format!("remotectl-agent/{}", CLIENT_VERSION))
            .timeout(options.connect_timeout)
            .build()?;

        Ok(Self {
            inner: Arc::new(Inner {
                session: Mutex::new(Session::new(credentials)),
                sink: tokio::sync::Mutex::new(None),
                reader: Mutex::new(None),
                keys,
                client_public_key_pem,
                options,
                handler,
                http,
                reconnect: RefreshSignal::new(),
                certificate_refresh: RefreshSignal::new(),
                cancel: cancel.child_token(),
            }),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.session.lock().state()
    }

    /// Snapshot of the current credentials, including rotated tokens
    pub fn credentials(&self) -> ClaimedClientData {
        self.inner.session.lock().credentials()
    }

    /// Hash of the public key announced to the server
    pub fn client_key_hash(&self) -> String {
        self.inner.keys.public_key_hash()
    }

    /// Request a certificate refresh outside the periodic schedule
    pub fn refresh_certificates(&self) {
        self.inner.certificate_refresh.signal();
    }

    /// Originate a command; `false` unless authenticated
    pub async fn send_command(&self, request: &CommandRequestMessage) -> Result<bool> {
        let envelope = Envelope::new(
            self.inner.options.machine_id.as_str(),
            SERVER_ADDRESS,
            wire_type::COMMAND,
        )
        .with_payload(request)?;
        self.inner.send_gated(envelope, false).await
    }

    /// Stop all loops and close the socket
    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    /// Run until stopped, cancelled, or a loop dies
    pub async fn run(&self) -> Result<()> {
        let options = &self.inner.options;
        let cancel = self.inner.cancel.clone();

        let inner = self.inner.clone();
        let reconnect = PeriodicRefresher::with_signal(
            "reconnect",
            self.inner.reconnect.clone(),
            None,
            options.reconnect_interval,
            move || {
                let inner = inner.clone();
                async move { inner.connect().await }
            },
            cancel.clone(),
        );

        let inner = self.inner.clone();
        let heartbeat = PeriodicRefresher::new(
            "heartbeat",
            Some(options.heartbeat_interval),
            Duration::from_secs(1),
            move || {
                let inner = inner.clone();
                async move { inner.heartbeat().await }
            },
            cancel.clone(),
        );

        let inner = self.inner.clone();
        let certificates = PeriodicRefresher::with_signal(
            "certificate-refresh",
            self.inner.certificate_refresh.clone(),
            Some(options.certificate_refresh_interval),
            options.certificate_refresh_min_interval,
            move || {
                let inner = inner.clone();
                async move { inner.refresh_certificates().await }
            },
            cancel.clone(),
        );

        self.inner.reconnect.signal();

        let mut loops = JoinSet::new();
        loops.spawn(reconnect.run_loop());
        loops.spawn(heartbeat.run_loop());
        loops.spawn(certificates.run_loop());

        let mut outcome = Ok(());
        if let Some(Err(e)) = loops.join_next().await {
            error!("Connection loop failed: {}", e);
            outcome = Err(RemoteError::InvalidState(format!("connection loop failed: {}", e)));
        }

        cancel.cancel();
        while let Some(result) = loops.join_next().await {
            if let Err(e) = result {
                error!("Connection loop failed during shutdown: {}", e);
            }
        }

        self.inner.shutdown().await;
        info!("Remote connection stopped");
        outcome
    }
}

impl Inner {
    /// Reconnect action
    async fn connect(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }

        let url = {
            let session = self.session.lock();
            if session.is_socket_open() {
                trace!("Socket already open, skipping reconnect");
                return;
            }
            session.server_url().to_string()
        };

        let config = WssClientConfig {
            url,
            user_agent: Some(format!("remotectl-agent/{}", CLIENT_VERSION)),
            timeout: self.options.connect_timeout,
            ..Default::default()
        };

        let client = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = WssClient::connect(config) => match result {
                Ok(client) => client,
                Err(e) => {
                    warn!("Failed to connect to server: {}", e);
                    return;
                }
            },
        };

        let (sender, receiver) = client.split();
        let generation = self.session.lock().socket_opened(Instant::now());
        *self.sink.lock().await = Some((generation, sender));

        let inner = self.clone();
        let reader = tokio::spawn(async move { inner.read_loop(generation, receiver).await });
        let previous = self.reader.lock().replace(reader.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }

        info!("Connected to server, waiting for welcome");
    }

    async fn read_loop(self: Arc<Self>, generation: u64, mut receiver: WssReceiver) {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return,
                frame = receiver.receive_text() => frame,
            };

            match frame {
                Ok(Some(text)) => {
                    if let Err(e) = self.process_frame(generation, &text).await {
                        warn!("Failed to process message: {}", e);
                        self.session.lock().fail();
                        break;
                    }
                }
                Ok(None) => {
                    info!("Server closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("Socket receive failed: {}", e);
                    break;
                }
            }
        }

        self.close_socket(generation).await;
    }

    async fn process_frame(self: &Arc<Self>, generation: u64, text: &str) -> Result<()> {
        let outcome = {
            let mut session = self.session.lock();
            if session.generation() != generation || !session.is_socket_open() {
                debug!("Dropping frame from stale socket");
                return Ok(());
            }
            session.handle_frame(
                text,
                &self.keys,
                &self.client_public_key_pem,
                Instant::now(),
            )
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e @ RemoteError::UntrustedCertificate(_)) => {
                info!("Server key not pinned, requesting certificate refresh");
                self.certificate_refresh.signal();
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        match outcome {
            FrameOutcome::SendAuth(envelope) => {
                if !self.send_gated(envelope, true).await? {
                    return Err(RemoteError::Socket("auth message not sent".to_string()));
                }
                debug!("Auth sent");
            }
            FrameOutcome::Authenticated { rekey } => {
                if let Some(credentials) = rekey {
                    info!("Rekeying after token rotation");
                    self.handler.on_rekey(credentials).await;
                }
            }
            FrameOutcome::Command { envelope, request } => {
                debug!("Command {} {} ({})", request.method, request.path, envelope.message_id);
                let weak: Weak<Self> = Arc::downgrade(self);
                let sink: Weak<dyn EnvelopeSink> = weak;
                let command = CommandMessage::new(request, Responder::new(sink, envelope));
                let handler = self.handler.clone();
                tokio::spawn(async move { handler.on_command(command).await });
            }
            FrameOutcome::Ignored => {}
        }

        Ok(())
    }

    /// Heartbeat action
    async fn heartbeat(self: &Arc<Self>) {
        let (liveness, generation) = {
            let mut session = self.session.lock();
            let liveness = session.check_liveness(Instant::now(), self.options.heartbeat_interval);
            (liveness, session.generation())
        };

        match liveness {
            Liveness::SocketDown => self.reconnect.signal(),
            Liveness::TimedOut => self.close_socket(generation).await,
            Liveness::Alive => {}
        }

        let ping = Envelope::new(
            self.options.machine_id.as_str(),
            SERVER_ADDRESS,
            wire_type::PING,
        );
        match self.send_gated(ping, true).await {
            Ok(true) => trace!("Ping sent"),
            Ok(false) => trace!("Ping skipped, no server key yet"),
            Err(e) => debug!("Ping failed: {}", e),
        }
    }

    /// Certificate refresh action
    async fn refresh_certificates(self: &Arc<Self>) {
        let url = self.session.lock().certificate_url().to_string();
        if url.is_empty() {
            debug!("No certificate URL, skipping refresh");
            return;
        }

        let fetched = match self.fetch_certificates(&url).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!("Certificate refresh failed: {}", e);
                return;
            }
        };

        let fetched_count = fetched.len();
        let usable = usable_certificates(fetched, Utc::now());
        let count = usable.len();
        let rekey = self.session.lock().replace_certificates(usable);

        match rekey {
            Some(credentials) => {
                info!(
                    "Certificate set refreshed: {} usable of {} fetched",
                    count, fetched_count
                );
                self.handler.on_rekey(credentials).await;
            }
            None => warn!(
                "Certificate refresh returned no usable certificates, keeping current set"
            ),
        }
    }

    /// Entries that do not deserialize are dropped, not fatal
    async fn fetch_certificates(&self, url: &str) -> Result<Vec<MiniServerCertificate>> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        let entries: Vec<serde_json::Value> = response.json().await?;

        Ok(entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_value(entry) {
                Ok(certificate) => Some(certificate),
                Err(e) => {
                    warn!("Skipping malformed certificate entry: {}", e);
                    None
                }
            })
            .collect())
    }

    /// Encrypt and send; `Ok(false)` when the gate is closed
    async fn send_gated(&self, envelope: Envelope, force: bool) -> Result<bool> {
        let gate = self.session.lock().outbound_key(force);
        let Some((key, generation)) = gate else {
            debug!(
                "Not sending {} message, connection not ready",
                envelope.message_type
            );
            return Ok(false);
        };

        let envelope = Envelope {
            from: self.options.machine_id.clone(),
            ..envelope
        };
        let token = encrypt_message(&envelope, &key)?;

        let result = {
            let mut sink = self.sink.lock().await;
            match sink.as_mut() {
                Some((current, sender)) if *current == generation => {
                    sender.send_text(&token).await
                }
                _ => return Ok(false),
            }
        };

        match result {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Send failed: {}", e);
                self.session.lock().fail();
                self.close_socket(generation).await;
                Err(e.into())
            }
        }
    }

    /// Close the socket of `generation` and schedule a reconnect
    async fn close_socket(&self, generation: u64) {
        if !self.session.lock().socket_closed(generation) {
            return;
        }

        let sender = {
            let mut sink = self.sink.lock().await;
            match sink.take() {
                Some((current, sender)) if current == generation => Some(sender),
                other => {
                    *sink = other;
                    None
                }
            }
        };

        if let Some(mut sender) = sender {
            let _ = sender.close().await;
        }

        info!("Disconnected from server");
        if !self.cancel.is_cancelled() {
            self.reconnect.signal();
        }
    }

    async fn shutdown(&self) {
        let generation = self.session.lock().generation();
        self.close_socket(generation).await;
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

#[async_trait]
impl EnvelopeSink for Inner {
    async fn send_envelope(&self, envelope: Envelope, force: bool) -> Result<bool> {
        self.send_gated(envelope, force).await
    }
}
