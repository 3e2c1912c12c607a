//! Handshake payloads

use serde::{Deserialize, Serialize};

/// Authentication request from client, sent once per socket
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthMessage {
    /// Long-lived access token
    #[serde(alias = "Token")]
    pub token: String,

    /// Client's RSA public key (for response encryption)
    #[serde(alias = "PublicKeyPem", alias = "publicKey", alias = "PublicKey")]
    pub public_key_pem: String,

    /// Client software version
    #[serde(alias = "ClientVersion")]
    pub client_version: String,

    /// Protocol version
    #[serde(alias = "ProtocolVersion")]
    pub protocol_version: i32,
}

/// First message on every new socket, sent by the server in plaintext
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeMessage {
    /// Hash of the server key the server will use; looked up in the pinned set
    #[serde(alias = "ServerPublicKeyHash")]
    pub server_public_key_hash: String,

    #[serde(default, alias = "MachineName")]
    pub machine_name: Option<String>,

    #[serde(default, alias = "ServerVersion")]
    pub server_version: Option<String>,

    #[serde(default, alias = "SupportedProtocolVersions")]
    pub supported_protocol_versions: Vec<i32>,
}

impl WelcomeMessage {
    /// Whether the server speaks the given protocol version
    ///
    /// An empty list means the server did not advertise versions.
    pub fn supports(&self, version: i32) -> bool {
        self.supported_protocol_versions.is_empty()
            || self.supported_protocol_versions.contains(&version)
    }
}

/// Authentication response from server
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AuthResultMessage {
    #[serde(default, alias = "Accepted")]
    pub accepted: Option<bool>,

    /// Server is rotating the access token
    #[serde(default, alias = "WillReplaceToken")]
    pub will_replace_token: Option<bool>,

    /// Replacement token
    #[serde(default, alias = "NewToken")]
    pub new_token: Option<String>,
}

impl AuthResultMessage {
    pub fn is_accepted(&self) -> bool {
        self.accepted == Some(true)
    }

    /// The replacement token, if the server announced a rotation
    pub fn replacement_token(&self) -> Option<&str> {
        match (self.will_replace_token, self.new_token.as_deref()) {
            (Some(true), Some(token)) if !token.is_empty() => Some(token),
            _ => None,
        }
    }
}
