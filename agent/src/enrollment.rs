//! Machine enrollment: register, then wait for a human to claim
//!
//! ```text
//! NotStarted -> Registering -> Registered -> WaitingForClaim -> Claimed
//!                          \-> Claimed (pre-claimed machine)
//! ```
//! `Failed` and `Disposed` are terminal. Disposal wins over a failure that
//! races with it.

use crate::CLIENT_VERSION;
use crate::error::{RemoteError, Result};
use crate::identity::ClientIdentity;
use crate::retry::retry;
use parking_lot::Mutex;
use remotectl_protocol::{
    ClaimStatusResponse, ClaimedClientData, RegisterClientData, RegistrationResponse,
};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Registration attempts when the caller does not say
pub const DEFAULT_REGISTER_ATTEMPTS: u32 = 5;

/// Delay between registration attempts when the caller does not say
pub const DEFAULT_REGISTER_INTERVAL: Duration = Duration::from_secs(5);

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnrollmentState {
    NotStarted,
    Registering,
    Registered,
    WaitingForClaim,
    Claimed,
    Failed,
    Disposed,
}

#[derive(Debug)]
struct Progress {
    state: EnrollmentState,
    registration: Option<RegisterClientData>,
    claimed: Option<ClaimedClientData>,
}

/// One enrollment attempt against the registration endpoint
pub struct Enrollment {
    registration_url: String,
    identity: ClientIdentity,
    http: reqwest::Client,
    cancel: CancellationToken,
    progress: Mutex<Progress>,
}

impl Enrollment {
    pub fn new(
        registration_url: impl Into<String>,
        identity: ClientIdentity,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(format!("remotectl-agent/{}", CLIENT_VERSION))
            .timeout(HTTP_TIMEOUT)
            .build()?;
        Ok(Self::with_client(registration_url, identity, http, cancel))
    }

    pub fn with_client(
        registration_url: impl Into<String>,
        identity: ClientIdentity,
        http: reqwest::Client,
        cancel: &CancellationToken,
    ) -> Self {
        Self {
            registration_url: registration_url.into(),
            identity,
            http,
            cancel: cancel.child_token(),
            progress: Mutex::new(Progress {
                state: EnrollmentState::NotStarted,
                registration: None,
                claimed: None,
            }),
        }
    }

    pub fn state(&self) -> EnrollmentState {
        self.progress.lock().state
    }

    /// Claim links, once registered
    pub fn registration_data(&self) -> Option<RegisterClientData> {
        self.progress.lock().registration.clone()
    }

    /// Register the machine
    ///
    /// A pre-claimed machine comes back as `RegistrationResponse::Claimed`
    /// and needs no `claim()`.
    pub async fn register(
        &self,
        max_retries: Option<u32>,
        retry_interval: Option<Duration>,
    ) -> Result<RegistrationResponse> {
        self.advance(EnrollmentState::NotStarted, EnrollmentState::Registering)?;

        let payload = self.identity.registration_payload(&self.registration_url);
        debug!("Registering machine at {}", self.registration_url);

        let result = retry(
            || self.post_registration(&payload),
            max_retries.unwrap_or(DEFAULT_REGISTER_ATTEMPTS),
            retry_interval.unwrap_or(DEFAULT_REGISTER_INTERVAL),
            &self.cancel,
        )
        .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => return Err(self.fail(e)),
        };

        let mut progress = self.progress.lock();
        if progress.state == EnrollmentState::Disposed {
            return Err(RemoteError::Cancelled);
        }

        match &response {
            RegistrationResponse::Claimed(claimed) => {
                info!("Machine was already claimed");
                progress.state = EnrollmentState::Claimed;
                progress.claimed = Some(claimed.clone());
            }
            RegistrationResponse::Pending(registration) => {
                info!("Machine registered, claim link: {}", registration.claim_link);
                progress.state = EnrollmentState::Registered;
                progress.registration = Some(registration.clone());
            }
        }

        Ok(response)
    }

    /// Wait until the machine is claimed
    ///
    /// Repeated calls after success return the cached credentials.
    pub async fn claim(&self) -> Result<ClaimedClientData> {
        let registration = {
            let mut progress = self.progress.lock();
            if let Some(claimed) = &progress.claimed {
                return Ok(claimed.clone());
            }
            if progress.state != EnrollmentState::Registered {
                return Err(invalid_transition(progress.state, "claim"));
            }
            let Some(registration) = progress.registration.clone() else {
                return Err(RemoteError::InvalidState(
                    "registered without claim data".to_string(),
                ));
            };
            progress.state = EnrollmentState::WaitingForClaim;
            registration
        };

        let payload = self.identity.registration_payload(&self.registration_url);
        let lifetime = registration.claim_lifetime();

        debug!(
            "Polling {} up to {} times, every {:?}, for at most {:?}",
            registration.status_link,
            registration.claim_attempts(),
            registration.retry_interval(),
            lifetime
        );

        let polling = retry(
            || self.poll_status(&registration.status_link, &payload),
            registration.claim_attempts(),
            registration.retry_interval(),
            &self.cancel,
        );

        let result = match tokio::time::timeout(lifetime, polling).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::ClaimFailed(format!(
                "machine was not claimed within {:?}",
                lifetime
            ))),
        };

        let claimed = match result {
            Ok(claimed) => claimed,
            Err(e) => return Err(self.fail(e)),
        };

        let mut progress = self.progress.lock();
        if progress.state == EnrollmentState::Disposed {
            return Err(RemoteError::Cancelled);
        }
        info!("Machine claimed");
        progress.state = EnrollmentState::Claimed;
        progress.registration = None;
        progress.claimed = Some(claimed.clone());
        Ok(claimed)
    }

    /// Cancel outstanding work; terminal
    pub fn dispose(&self) {
        self.cancel.cancel();
        self.progress.lock().state = EnrollmentState::Disposed;
    }

    fn advance(&self, from: EnrollmentState, to: EnrollmentState) -> Result<()> {
        let mut progress = self.progress.lock();
        if progress.state == EnrollmentState::Disposed {
            return Err(RemoteError::Cancelled);
        }
        if progress.state != from {
            return Err(invalid_transition(progress.state, "register"));
        }
        progress.state = to;
        Ok(())
    }

    fn fail(&self, error: RemoteError) -> RemoteError {
        let mut progress = self.progress.lock();
        if progress.state == EnrollmentState::Disposed {
            return RemoteError::Cancelled;
        }
        warn!("Enrollment failed: {}", error);
        progress.state = EnrollmentState::Failed;
        error
    }

    async fn post_registration(&self, payload: &Map<String, Value>) -> Result<RegistrationResponse> {
        let response = self
            .http
            .post(&self.registration_url)
            .json(payload)
            .send()
            .await
            .map_err(|e| RemoteError::RegistrationFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::RegistrationFailed(format!(
                "registration returned {}: {}",
                status, body
            )));
        }

        response
            .json()
            .await
            .map_err(|e| RemoteError::RegistrationFailed(format!("unexpected response: {}", e)))
    }

    async fn poll_status(
        &self,
        status_link: &str,
        payload: &Map<String, Value>,
    ) -> Result<ClaimedClientData> {
        let response = self
            .http
            .post(status_link)
            .json(payload)
            .send()
            .await
            .map_err(|e| RemoteError::ClaimFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::ClaimFailed(format!(
                "status check returned {}",
                status
            )));
        }

        let status: ClaimStatusResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::ClaimFailed(format!("unexpected response: {}", e)))?;

        if !status.success {
            return Err(RemoteError::ClaimFailed(
                status
                    .status_message
                    .unwrap_or_else(|| "machine not claimed yet".to_string()),
            ));
        }

        status.into_claimed().ok_or_else(|| {
            RemoteError::ClaimFailed("claim response is missing credentials".to_string())
        })
    }
}

impl Drop for Enrollment {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn invalid_transition(state: EnrollmentState, operation: &str) -> RemoteError {
    RemoteError::InvalidState(format!("cannot {} while {:?}", operation, state))
}
