//! Persisted agent credentials

use anyhow::Result;
use remotectl_protocol::{ClaimedClientData, MiniServerCertificate};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Credentials and identity kept between runs
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentSettings {
    #[serde(default)]
    pub jwt: Option<String>,

    #[serde(default)]
    pub server_url: Option<String>,

    #[serde(default)]
    pub certificate_url: Option<String>,

    #[serde(default)]
    pub server_certificates: Vec<MiniServerCertificate>,

    #[serde(default)]
    pub settings_encryption_key: Option<String>,

    #[serde(default)]
    pub machine_id: String,

    #[serde(skip)]
    path: PathBuf,
}

impl AgentSettings {
    /// Load settings, creating a machine id on first run
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut settings = match tokio::fs::read_to_string(path).await {
            Ok(content) => serde_json::from_str::<AgentSettings>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No settings at {}, starting fresh", path.display());
                AgentSettings::default()
            }
            Err(e) => return Err(e.into()),
        };
        settings.path = path.to_path_buf();

        if settings.machine_id.is_empty() {
            settings.machine_id = uuid::Uuid::new_v4().to_string();
            settings.save().await?;
        }

        Ok(settings)
    }

    pub async fn save(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Claimed credentials, if enrollment has completed
    pub fn claimed(&self) -> Option<ClaimedClientData> {
        let jwt = self.jwt.clone().filter(|jwt| !jwt.is_empty())?;
        let server_url = self.server_url.clone().filter(|url| !url.is_empty())?;

        Some(ClaimedClientData {
            jwt,
            server_url,
            certificate_url: self.certificate_url.clone().unwrap_or_default(),
            server_certificates: self.server_certificates.clone(),
            local_encryption_key: self.settings_encryption_key.clone(),
        })
    }

    /// Store freshly claimed credentials
    pub fn apply_claim(&mut self, claimed: &ClaimedClientData) {
        self.jwt = Some(claimed.jwt.clone());
        self.server_url = Some(claimed.server_url.clone());
        self.certificate_url = Some(claimed.certificate_url.clone());
        self.server_certificates = claimed.server_certificates.clone();
        self.settings_encryption_key = claimed.local_encryption_key.clone();
    }

    /// Merge an updated credential bundle; returns whether anything changed
    pub fn apply_rekey(&mut self, update: &ClaimedClientData) -> bool {
        let mut changed = false;

        if !update.jwt.is_empty() && self.jwt.as_deref() != Some(update.jwt.as_str()) {
            info!("Rekey: replacing access token");
            self.jwt = Some(update.jwt.clone());
            changed = true;
        }

        if !update.server_certificates.is_empty()
            && update.server_certificates != self.server_certificates
        {
            info!(
                "Rekey: replacing server certificates ({} entries)",
                update.server_certificates.len()
            );
            self.server_certificates = update.server_certificates.clone();
            changed = true;
        }

        if update
            .local_encryption_key
            .as_ref()
            .is_some_and(|key| self.settings_encryption_key.as_ref() != Some(key))
        {
            warn!("Rekey: server sent a new local encryption key, keeping the current one");
        }

        changed
    }
}
