use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hue_core::config::{Config, MAX_BUTTON_TIMEOUT_SECS};
use hue_core::models::{ClientCredential, ClientRequest};
use serde::Serialize;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::clock::Clock;
use crate::indicator::{IndicatorEvent, IndicatorSink};

pub const DEFAULT_CONFIRMED_GRACE: Duration = Duration::seconds(2);
pub const SECURE_CONFIRMATIONS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingStatus {
    Idle,
    AwaitingConfirmation,
    Confirmed,
    Expired,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PairingError {
    #[error("a pairing session is already open")]
    SessionAlreadyOpen,
    #[error("no pairing session is open")]
    NoActiveSession,
    #[error("the pairing session expired")]
    SessionExpired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingSettings {
    pub timeout: Duration,
    pub required_confirmations: u32,
    pub confirmed_grace: Duration,
}

impl PairingSettings {
    pub fn new(timeout_secs: u64, security_mode: bool) -> Self {
        let secs = timeout_secs.clamp(1, MAX_BUTTON_TIMEOUT_SECS);
        if secs != timeout_secs {
            tracing::warn!(
                requested = timeout_secs,
                applied = secs,
                "Link button timeout out of range; clamped"
            );
        }
        Self {
            timeout: Duration::seconds(secs as i64),
            required_confirmations: if security_mode { SECURE_CONFIRMATIONS } else { 1 },
            confirmed_grace: DEFAULT_CONFIRMED_GRACE,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.button_timeout_secs, config.security_mode)
    }

    pub fn with_confirmed_grace(mut self, grace: Duration) -> Self {
        self.confirmed_grace = grace;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingSession {
    pub status: PairingStatus,
    pub opened_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub confirmations_received: u32,
    pub required_confirmations: u32,
    pub confirmed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Pending { received: u32, required: u32 },
    Confirmed(ClientCredential),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingSnapshot {
    pub status: PairingStatus,
    pub opened_at: Option<OffsetDateTime>,
    pub expires_at: Option<OffsetDateTime>,
    pub confirmations_received: u32,
    pub required_confirmations: u32,
    pub time_remaining_secs: u64,
}

#[derive(Debug, Default)]
struct SessionSlot {
    current: Option<PairingSession>,
    /// Deadline of the last window, kept once that window has closed so late
    /// confirmations can be told it lapsed. Cleared by open and reset.
    lapsed_deadline: Option<OffsetDateTime>,
}

/// Owns the single link-button pairing window.
///
/// Every transition runs inside one mutex critical section; expiry is checked
/// lazily on each access, so concurrent callers observe exactly one expiry and
/// exactly one confirmation per session.
pub struct PairingSessionManager {
    settings: PairingSettings,
    clock: Arc<dyn Clock>,
    indicator: Arc<dyn IndicatorSink>,
    session: Mutex<SessionSlot>,
}

impl std::fmt::Debug for PairingSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairingSessionManager")
            .field("settings", &self.settings)
            .field("session", &self.lock().current)
            .finish()
    }
}

impl PairingSessionManager {
    pub fn new(
        settings: PairingSettings,
        clock: Arc<dyn Clock>,
        indicator: Arc<dyn IndicatorSink>,
    ) -> Self {
        Self {
            settings,
            clock,
            indicator,
            session: Mutex::new(SessionSlot::default()),
        }
    }

    pub fn settings(&self) -> &PairingSettings {
        &self.settings
    }

    fn lock(&self) -> MutexGuard<'_, SessionSlot> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies time-driven transitions. Returns the terminal status that was
    /// left behind, if any.
    fn advance(
        &self,
        slot: &mut SessionSlot,
        now: OffsetDateTime,
    ) -> Option<PairingStatus> {
        let session = slot.current.as_ref()?;
        match session.status {
            PairingStatus::AwaitingConfirmation if now >= session.expires_at => {
                tracing::info!(
                    confirmations = session.confirmations_received,
                    required = session.required_confirmations,
                    "Link button timeout expired"
                );
                slot.lapsed_deadline = Some(session.expires_at);
                slot.current = None;
                self.indicator.on_event(IndicatorEvent::Expired);
                self.indicator.on_event(IndicatorEvent::Idle);
                Some(PairingStatus::Expired)
            }
            PairingStatus::Confirmed => {
                let confirmed_at = session.confirmed_at.unwrap_or(session.opened_at);
                if now < confirmed_at + self.settings.confirmed_grace {
                    return None;
                }
                tracing::debug!("Pairing session closed after confirmation");
                slot.lapsed_deadline = Some(session.expires_at);
                slot.current = None;
                self.indicator.on_event(IndicatorEvent::Idle);
                Some(PairingStatus::Confirmed)
            }
            _ => None,
        }
    }

    pub fn open_session(&self) -> Result<PairingSession, PairingError> {
        let now = self.clock.now();
        let mut slot = self.lock();
        self.advance(&mut slot, now);

        if let Some(existing) = slot.current.as_ref() {
            tracing::debug!(status = ?existing.status, "Link button pressed while a session is open");
            return Err(PairingError::SessionAlreadyOpen);
        }

        let session = PairingSession {
            status: PairingStatus::AwaitingConfirmation,
            opened_at: now,
            expires_at: now + self.settings.timeout,
            confirmations_received: 0,
            required_confirmations: self.settings.required_confirmations,
            confirmed_at: None,
        };
        tracing::info!(
            timeout_secs = self.settings.timeout.whole_seconds(),
            required = session.required_confirmations,
            "Link button pressed; pairing window open"
        );
        slot.current = Some(session.clone());
        slot.lapsed_deadline = None;
        self.indicator.on_event(IndicatorEvent::AwaitingConfirmation);
        Ok(session)
    }

    pub fn confirm(&self, request: &ClientRequest) -> Result<ConfirmOutcome, PairingError> {
        let now = self.clock.now();
        let mut slot = self.lock();
        if self.advance(&mut slot, now) == Some(PairingStatus::Expired) {
            tracing::warn!(device = %request.device_type, "Pairing attempt after timeout");
            return Err(PairingError::SessionExpired);
        }

        let lapsed = slot.lapsed_deadline.is_some_and(|deadline| now >= deadline);
        let session = match slot.current.as_mut() {
            Some(session) if session.status == PairingStatus::AwaitingConfirmation => session,
            None if lapsed => {
                tracing::warn!(device = %request.device_type, "Pairing attempt after timeout");
                return Err(PairingError::SessionExpired);
            }
            _ => {
                tracing::warn!(device = %request.device_type, "Link button not pressed");
                return Err(PairingError::NoActiveSession);
            }
        };

        session.confirmations_received += 1;
        let received = session.confirmations_received;
        let required = session.required_confirmations;

        if received < required {
            tracing::info!(device = %request.device_type, received, required, "Pairing confirmation received");
            self.indicator
                .on_event(IndicatorEvent::PartialConfirmation(received));
            return Ok(ConfirmOutcome::Pending { received, required });
        }

        session.status = PairingStatus::Confirmed;
        session.confirmed_at = Some(now);
        let credential = issue_credential(request, now);
        tracing::info!(
            device = %request.device_type,
            client_id = %credential.client_id,
            client_key = credential.client_key.is_some(),
            "Pairing confirmed; credential issued"
        );
        self.indicator.on_event(IndicatorEvent::Confirmed);
        Ok(ConfirmOutcome::Confirmed(credential))
    }

    /// Takes back a confirmation whose credential could not be kept, so the
    /// client can retry inside the same window. Returns false when the session
    /// no longer holds that confirmation.
    pub fn revert_confirmation(&self, credential: &ClientCredential) -> bool {
        let mut slot = self.lock();
        let Some(session) = slot.current.as_mut() else {
            return false;
        };
        if session.status != PairingStatus::Confirmed
            || session.confirmed_at != Some(credential.issued_at)
        {
            return false;
        }

        session.status = PairingStatus::AwaitingConfirmation;
        session.confirmed_at = None;
        session.confirmations_received = session.required_confirmations - 1;
        let received = session.confirmations_received;
        tracing::warn!(
            client_id = %credential.client_id,
            received,
            "Pairing confirmation reverted"
        );
        self.indicator.on_event(if received == 0 {
            IndicatorEvent::AwaitingConfirmation
        } else {
            IndicatorEvent::PartialConfirmation(received)
        });
        true
    }

    /// Runs the time-driven transitions, including the reset after the
    /// confirmed grace period. Returns true only for the call that expired
    /// the session.
    pub fn check_expiry(&self) -> bool {
        let now = self.clock.now();
        let mut slot = self.lock();
        self.advance(&mut slot, now) == Some(PairingStatus::Expired)
    }

    /// Forces the manager back to idle, whatever the current state.
    pub fn reset(&self) -> PairingStatus {
        let mut slot = self.lock();
        slot.lapsed_deadline = None;
        let previous = slot
            .current
            .take()
            .map(|session| session.status)
            .unwrap_or(PairingStatus::Idle);
        tracing::info!(?previous, "Link button state reset");
        self.indicator.on_event(IndicatorEvent::Idle);
        previous
    }

    pub fn snapshot(&self) -> PairingSnapshot {
        let now = self.clock.now();
        let mut slot = self.lock();
        self.advance(&mut slot, now);

        match slot.current.as_ref() {
            Some(session) => PairingSnapshot {
                status: session.status,
                opened_at: Some(session.opened_at),
                expires_at: Some(session.expires_at),
                confirmations_received: session.confirmations_received,
                required_confirmations: session.required_confirmations,
                time_remaining_secs: match session.status {
                    PairingStatus::AwaitingConfirmation => {
                        (session.expires_at - now).whole_seconds().max(0) as u64
                    }
                    _ => 0,
                },
            },
            None => PairingSnapshot {
                status: PairingStatus::Idle,
                opened_at: None,
                expires_at: None,
                confirmations_received: 0,
                required_confirmations: self.settings.required_confirmations,
                time_remaining_secs: 0,
            },
        }
    }
}

fn issue_credential(request: &ClientRequest, now: OffsetDateTime) -> ClientCredential {
    ClientCredential {
        client_id: Uuid::new_v4().simple().to_string(),
        client_key: request
            .generate_client_key
            .then(|| Uuid::new_v4().simple().to_string().to_uppercase()),
        name: request.device_type.clone(),
        issued_at: now,
    }
}
