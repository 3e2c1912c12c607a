//! Handshake state machine of one remote connection
//!
//! `Session` holds every piece of mutable connection state as one unit.
//! It does no I/O: frames go in, outcomes come out, and the connection
//! runtime performs the sends those outcomes ask for. Callers keep it
//! behind a single lock so a transition is never observed half done.

use crate::error::{RemoteError, Result};
use chrono::Utc;
use remotectl_crypto::{ClientKeyPair, ServerPublicKey, parse_encrypted};
use remotectl_protocol::{
    AuthMessage, AuthResultMessage, ClaimedClientData, CommandRequestMessage, Envelope,
    MessageType, MiniServerCertificate, PROTOCOL_VERSION, WelcomeMessage, find_certificate,
    wire_type,
};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Connection state, reset on every new socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    NotConnected,
    WelcomeReceived,
    Authenticated,
    Error,
}

/// What the runtime must do after a frame was accepted
#[derive(Debug)]
pub enum FrameOutcome {
    /// Welcome accepted; send this auth envelope to the server, bypassing the gate
    SendAuth(Envelope),

    /// Handshake completed; `rekey` carries a rotated token to persist
    Authenticated { rekey: Option<ClaimedClientData> },

    /// Command to hand to the command handler
    Command {
        envelope: Envelope,
        request: CommandRequestMessage,
    },

    /// Frame consumed without further action
    Ignored,
}

/// Result of a liveness check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// No socket; reconnect is due
    SocketDown,
    /// Handshake or session went quiet; socket must be closed
    TimedOut,
    Alive,
}

/// Mutable state shared by the reader and the background loops
#[derive(Debug)]
pub struct Session {
    state: ConnectionState,
    credentials: ClaimedClientData,
    server_certificate: Option<MiniServerCertificate>,
    server_key: Option<ServerPublicKey>,
    last_message_received: Instant,
    generation: u64,
    socket_open: bool,
}

impl Session {
    pub fn new(credentials: ClaimedClientData) -> Self {
        Self {
            state: ConnectionState::NotConnected,
            credentials,
            server_certificate: None,
            server_key: None,
            last_message_received: Instant::now(),
            generation: 0,
            socket_open: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_socket_open(&self) -> bool {
        self.socket_open
    }

    pub fn server_url(&self) -> &str {
        &self.credentials.server_url
    }

    pub fn certificate_url(&self) -> &str {
        &self.credentials.certificate_url
    }

    pub fn certificates(&self) -> &[MiniServerCertificate] {
        &self.credentials.server_certificates
    }

    pub fn server_certificate(&self) -> Option<&MiniServerCertificate> {
        self.server_certificate.as_ref()
    }

    /// Consistent copy of the current credentials
    pub fn credentials(&self) -> ClaimedClientData {
        self.credentials.clone()
    }

    /// A new socket is up; returns its generation
    pub fn socket_opened(&mut self, now: Instant) -> u64 {
        self.generation += 1;
        self.state = ConnectionState::NotConnected;
        self.server_certificate = None;
        self.server_key = None;
        self.last_message_received = now;
        self.socket_open = true;
        self.generation
    }

    /// The socket of `generation` went away; stale notifications are ignored
    ///
    /// `Error` is kept until the next socket resets the session.
    pub fn socket_closed(&mut self, generation: u64) -> bool {
        if generation != self.generation || !self.socket_open {
            return false;
        }
        self.socket_open = false;
        if self.state != ConnectionState::Error {
            self.state = ConnectionState::NotConnected;
        }
        true
    }

    /// Force the error state, e.g. after a send failure
    pub fn fail(&mut self) {
        self.state = ConnectionState::Error;
    }

    /// Key to encrypt an outbound envelope with, if the gate is open
    ///
    /// Non-forced sends require `Authenticated`. Every send requires a
    /// known server key.
    pub fn outbound_key(&self, force: bool) -> Option<(ServerPublicKey, u64)> {
        if !self.socket_open {
            return None;
        }
        if !force && self.state != ConnectionState::Authenticated {
            return None;
        }
        self.server_key
            .clone()
            .map(|key| (key, self.generation))
    }

    /// Check for a dead socket or a silent server
    ///
    /// A timeout moves the session to `Error`.
    pub fn check_liveness(&mut self, now: Instant, heartbeat: Duration) -> Liveness {
        if !self.socket_open {
            return Liveness::SocketDown;
        }

        let waiting = matches!(
            self.state,
            ConnectionState::WelcomeReceived | ConnectionState::Authenticated
        );
        if waiting && now.duration_since(self.last_message_received) > heartbeat * 2 {
            warn!(
                "No message from server for {:?}, dropping connection",
                now.duration_since(self.last_message_received)
            );
            self.state = ConnectionState::Error;
            return Liveness::TimedOut;
        }

        Liveness::Alive
    }

    /// Publish a refreshed certificate set
    ///
    /// An empty set never replaces the current one. Returns the credential
    /// snapshot to hand to the rekey callback.
    pub fn replace_certificates(
        &mut self,
        certificates: Vec<MiniServerCertificate>,
    ) -> Option<ClaimedClientData> {
        if certificates.is_empty() {
            return None;
        }
        self.credentials.server_certificates = certificates;
        Some(self.rekey_snapshot())
    }

    fn rekey_snapshot(&self) -> ClaimedClientData {
        ClaimedClientData {
            local_encryption_key: None,
            ..self.credentials.clone()
        }
    }

    /// Process one inbound frame
    ///
    /// Any failure leaves the session in `Error`.
    pub fn handle_frame(
        &mut self,
        raw: &str,
        keys: &ClientKeyPair,
        client_public_key_pem: &str,
        now: Instant,
    ) -> Result<FrameOutcome> {
        self.last_message_received = now;

        let result = match self.state {
            ConnectionState::NotConnected => self.on_welcome(raw, client_public_key_pem),
            ConnectionState::WelcomeReceived => self.on_auth_result(raw, keys),
            ConnectionState::Authenticated => self.on_session_frame(raw, keys),
            ConnectionState::Error => Err(RemoteError::ProtocolViolation(
                "message received in error state".to_string(),
            )),
        };

        if result.is_err() {
            self.state = ConnectionState::Error;
        }
        result
    }

    fn on_welcome(&mut self, raw: &str, client_public_key_pem: &str) -> Result<FrameOutcome> {
        let envelope = Envelope::parse(raw)?;
        if envelope.classify() != MessageType::Welcome {
            return Err(RemoteError::ProtocolViolation(format!(
                "expected welcome, got {}",
                envelope.message_type
            )));
        }

        let welcome: WelcomeMessage = envelope.payload_as()?;
        if !welcome.supports(PROTOCOL_VERSION) {
            return Err(RemoteError::ProtocolViolation(format!(
                "server supports protocol versions {:?}, client speaks {}",
                welcome.supported_protocol_versions, PROTOCOL_VERSION
            )));
        }

        let certificate = find_certificate(
            &self.credentials.server_certificates,
            &welcome.server_public_key_hash,
            Utc::now(),
        )
        .cloned()
        .ok_or_else(|| {
            RemoteError::UntrustedCertificate(format!(
                "no valid certificate for key {}",
                welcome.server_public_key_hash
            ))
        })?;

        let key = ServerPublicKey::from_pem(&certificate.public_key_pem)
            .map_err(|e| RemoteError::UntrustedCertificate(e.to_string()))?;

        info!(
            "Welcome from {} (server {}), key {}",
            welcome.machine_name.as_deref().unwrap_or("server"),
            welcome.server_version.as_deref().unwrap_or("unknown"),
            certificate.public_key_hash
        );

        self.server_certificate = Some(certificate);
        self.server_key = Some(key);
        self.state = ConnectionState::WelcomeReceived;

        let auth = AuthMessage {
            token: self.credentials.jwt.clone(),
            public_key_pem: client_public_key_pem.to_string(),
            client_version: crate::CLIENT_VERSION.to_string(),
            protocol_version: PROTOCOL_VERSION,
        };
        let reply = envelope.respond_with(&auth, Some(wire_type::AUTH))?;
        Ok(FrameOutcome::SendAuth(reply))
    }

    fn on_auth_result(&mut self, raw: &str, keys: &ClientKeyPair) -> Result<FrameOutcome> {
        let envelope = parse_encrypted(raw, keys)?;
        if envelope.classify() != MessageType::Auth {
            return Err(RemoteError::ProtocolViolation(format!(
                "expected auth result, got {}",
                envelope.message_type
            )));
        }

        let result: AuthResultMessage = envelope.payload_as()?;
        if !result.is_accepted() {
            return Err(RemoteError::ProtocolViolation(
                "authentication rejected".to_string(),
            ));
        }

        let rekey = result.replacement_token().map(|token| {
            info!("Server rotated the access token");
            self.credentials.jwt = token.to_string();
            self.rekey_snapshot()
        });

        self.state = ConnectionState::Authenticated;
        info!("Authenticated with server");
        Ok(FrameOutcome::Authenticated { rekey })
    }

    fn on_session_frame(&mut self, raw: &str, keys: &ClientKeyPair) -> Result<FrameOutcome> {
        let envelope = parse_encrypted(raw, keys)?;

        match envelope.classify() {
            MessageType::Pong => {
                debug!("Pong {}", envelope.message_id);
                Ok(FrameOutcome::Ignored)
            }
            MessageType::Command => {
                let request: CommandRequestMessage = envelope.payload_as()?;
                Ok(FrameOutcome::Command { envelope, request })
            }
            MessageType::Unknown => {
                warn!("Ignoring message of unknown type {}", envelope.message_type);
                Ok(FrameOutcome::Ignored)
            }
            other => Err(RemoteError::ProtocolViolation(format!(
                "unexpected {:?} message while authenticated",
                other
            ))),
        }
    }
}
