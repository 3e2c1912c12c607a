//! Machine identity reported during enrollment

use crate::CLIENT_VERSION;
use reqwest::Url;
use serde_json::{Map, Value};

/// Identity of this agent instance
///
/// Passed explicitly to whoever needs it; nothing here is process global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Fresh per process
    pub instance_id: String,
    /// Stable across restarts, persisted in the settings file
    pub machine_id: String,
    pub machine_name: String,
    pub install_id: String,
    pub client_version: String,
    pub package_type: String,
    pub operating_system: String,
}

impl ClientIdentity {
    /// Identity for this host
    pub fn detect(machine_id: impl Into<String>, install_id: impl Into<String>) -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            machine_id: machine_id.into(),
            machine_name: host_name(),
            install_id: install_id.into(),
            client_version: CLIENT_VERSION.to_string(),
            package_type: "agent".to_string(),
            operating_system: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }

    /// JSON body posted to the registration and claim endpoints
    ///
    /// Query parameters on `registration_url` override fields with the same
    /// name (case-insensitive) or add new ones.
    pub fn registration_payload(&self, registration_url: &str) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("instanceId".into(), self.instance_id.clone().into());
        payload.insert("machineId".into(), self.machine_id.clone().into());
        payload.insert("machineName".into(), self.machine_name.clone().into());
        payload.insert("installId".into(), self.install_id.clone().into());
        payload.insert("localTime".into(), chrono::Local::now().to_rfc3339().into());
        payload.insert("clientVersion".into(), self.client_version.clone().into());
        payload.insert("packageTypeId".into(), self.package_type.clone().into());
        payload.insert("operatingSystem".into(), self.operating_system.clone().into());

        if let Ok(url) = Url::parse(registration_url) {
            for (name, value) in url.query_pairs() {
                let key = payload
                    .keys()
                    .find(|key| key.eq_ignore_ascii_case(&name))
                    .cloned()
                    .unwrap_or_else(|| name.to_string());
                payload.insert(key, Value::String(value.into_owned()));
            }
        }

        payload
    }
}

fn host_name() -> String {
    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|name| !name.is_empty()))
        .unwrap_or_else(|| "unknown".to_string())
}
