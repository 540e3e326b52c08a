//! Per-destination upload sessions.
//!
//! An [`UploadService`] owns one destination. It renders readings through
//! the destination's field template, enforces the minimum interval
//! between attempts and drives the protocol through its session states:
//!
//! ```text
//! Idle -> SessionOpen -> Authenticated -> Sent -> Closed
//!   \________\________________\____________\-> Failed(kind)
//! ```
//!
//! Attempts against one destination never overlap: live uploads skip when
//! another attempt holds the destination, catch-up waits for it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use wxrelay_core::{
    AggregationEngine, DedupeExt, FieldSpec, FieldTemplate, Resolved, TemplateContext,
};
use wxrelay_store::StatusStore;
use wxrelay_types::Reading;

use crate::clock::Clock;
use crate::config::DestinationConfig;
use crate::error::{FailureKind, UploadError};

/// Which dispatcher path drives an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// The most recent reading, as soon as it arrives.
    Live,
    /// Missed readings, oldest first, bounded by the catch-up depth.
    Logged,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Live => write!(f, "live"),
            Mode::Logged => write!(f, "logged"),
        }
    }
}

/// Session state of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttemptState {
    Idle,
    SessionOpen,
    Authenticated,
    Sent,
    Closed,
    Failed(FailureKind),
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptState::Idle => write!(f, "idle"),
            AttemptState::SessionOpen => write!(f, "session-open"),
            AttemptState::Authenticated => write!(f, "authenticated"),
            AttemptState::Sent => write!(f, "sent"),
            AttemptState::Closed => write!(f, "closed"),
            AttemptState::Failed(kind) => write!(f, "failed ({})", kind),
        }
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    RetryableFailure,
    PermanentFailure,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

impl From<FailureKind> for Outcome {
    fn from(kind: FailureKind) -> Self {
        match kind {
            FailureKind::Retryable => Outcome::RetryableFailure,
            FailureKind::Permanent => Outcome::PermanentFailure,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::RetryableFailure => write!(f, "retryable-failure"),
            Outcome::PermanentFailure => write!(f, "permanent-failure"),
        }
    }
}

/// Record of one upload attempt. Only the watermark and attempt start it
/// implies are persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadAttempt {
    pub destination: String,
    pub reading_at: OffsetDateTime,
    pub mode: Mode,
    pub outcome: Outcome,
    /// Final session state: `Closed` on success, `Failed` otherwise.
    pub state: AttemptState,
    pub message: String,
}

impl UploadAttempt {
    fn log(&self) {
        match self.outcome {
            Outcome::Success => info!(
                destination = %self.destination,
                mode = %self.mode,
                reading = %self.reading_at,
                outcome = %self.outcome,
                message = %self.message,
                "Upload attempt"
            ),
            _ => warn!(
                destination = %self.destination,
                mode = %self.mode,
                reading = %self.reading_at,
                outcome = %self.outcome,
                message = %self.message,
                "Upload attempt"
            ),
        }
    }
}

/// Wire behaviour of a destination kind.
///
/// Each step is bounded by the service's timeout; `close` is always called
/// once a session was opened, whatever happened after.
#[async_trait]
pub trait Protocol: Send + Sync + 'static {
    /// Connection state carried between steps.
    type Session: Send;

    /// Short name used in logs and errors.
    fn kind(&self) -> &'static str;

    /// The field table this destination renders.
    fn template(&self) -> &'static [FieldSpec];

    /// Hardware and parameters the template is evaluated against.
    fn context(&self) -> TemplateContext;

    /// Whether uploads need a remote identity from [`Protocol::register`].
    fn needs_identity(&self) -> bool {
        false
    }

    async fn open_session(&self) -> Result<Self::Session, UploadError>;

    async fn authenticate(&self, session: &mut Self::Session) -> Result<(), UploadError>;

    /// Deliver one rendered reading. Returns the server's acknowledgement.
    async fn send(
        &self,
        session: &mut Self::Session,
        fields: &Resolved,
        identity: Option<&str>,
    ) -> Result<String, UploadError>;

    async fn close(&self, session: Self::Session);

    /// Create the remote identity, or update it in place when `existing`
    /// is set. Returns the identity to persist.
    async fn register(&self, existing: Option<&str>) -> Result<String, UploadError> {
        let _ = existing;
        Err(UploadError::RegistrationUnsupported(self.kind()))
    }
}

/// Scheduling settings of one destination.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadSettings {
    /// Minimum time between attempt starts.
    pub interval: Duration,
    /// Most missed readings uploaded by one catch-up pass.
    pub catchup: usize,
    /// Limit on each network step.
    pub timeout: std::time::Duration,
    pub live: bool,
    pub logged: bool,
}

impl UploadSettings {
    pub fn from_config(config: &DestinationConfig) -> Self {
        Self {
            interval: config.interval(),
            catchup: config.catchup(),
            timeout: config.timeout(),
            live: config.has_mode(Mode::Live),
            logged: config.has_mode(Mode::Logged),
        }
    }

    pub fn has_mode(&self, mode: Mode) -> bool {
        match mode {
            Mode::Live => self.live,
            Mode::Logged => self.logged,
        }
    }
}

/// Drives one destination.
pub struct UploadService<P: Protocol> {
    id: String,
    protocol: P,
    engine: Arc<AggregationEngine>,
    status: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
    settings: UploadSettings,
    template: FieldTemplate,
    context: TemplateContext,
    lock: Mutex<()>,
}

impl<P: Protocol> fmt::Debug for UploadService<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadService")
            .field("id", &self.id)
            .field("kind", &self.protocol.kind())
            .field("settings", &self.settings)
            .finish()
    }
}

impl<P: Protocol> UploadService<P> {
    pub fn new(
        id: impl Into<String>,
        protocol: P,
        engine: Arc<AggregationEngine>,
        status: Arc<dyn StatusStore>,
        clock: Arc<dyn Clock>,
        settings: UploadSettings,
    ) -> Self {
        let context = protocol.context();
        let template = FieldTemplate::applicable(protocol.template(), &context);
        Self {
            id: id.into(),
            protocol,
            engine,
            status,
            clock,
            settings,
            template,
            context,
            lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> &P {
        &self.protocol
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    /// Render `reading` with its derived values through this destination's
    /// template.
    pub fn prepare(&self, reading: &Reading) -> Resolved {
        let derived = self.engine.derive(reading);
        let resolved = self.template.resolve(reading, &derived, &self.context);
        if !resolved.degraded.is_empty() {
            debug!(
                destination = %self.id,
                reading = %reading.timestamp,
                degraded = ?resolved.degraded,
                "Uploading with degraded fields"
            );
        }
        resolved
    }

    /// Upload the newest reading if the destination is free and its
    /// interval has elapsed. Returns `None` when the attempt was skipped.
    pub async fn upload_live(&self, reading: &Reading) -> Option<UploadAttempt> {
        if !self.settings.live {
            return None;
        }
        let Ok(_guard) = self.lock.try_lock() else {
            debug!(destination = %self.id, "Attempt in flight, skipping live reading");
            return None;
        };

        let status = match self.status.upload_status(&self.id) {
            Ok(status) => status,
            Err(e) => {
                warn!(destination = %self.id, "Failed to read upload status: {}", e);
                return None;
            }
        };
        if let Some(watermark) = status.watermark
            && reading.timestamp <= watermark
        {
            debug!(destination = %self.id, reading = %reading.timestamp, "Already uploaded");
            return None;
        }
        if let Some(next) = status.last_attempt_at.map(|t| t + self.settings.interval)
            && self.clock.now() < next
        {
            debug!(destination = %self.id, next = %next, "Throttled, skipping live reading");
            return None;
        }

        Some(self.attempt(reading, Mode::Live).await)
    }

    /// Readings newer than the watermark that one catch-up pass would send,
    /// oldest first.
    pub fn pending(&self) -> Result<Vec<Reading>, UploadError> {
        if self.settings.catchup == 0 {
            return Ok(Vec::new());
        }
        let store = self.engine.store();
        let Some(latest) = store.latest()? else {
            return Ok(Vec::new());
        };
        let watermark = self.status.upload_status(&self.id)?.watermark;
        let floor = match watermark {
            Some(w) => w,
            None => match store.first()? {
                Some(first) => first.timestamp,
                None => return Ok(Vec::new()),
            },
        };

        // Read back from the newest reading in widening windows until one
        // holds enough readings or reaches the floor.
        let depth = i32::try_from(self.settings.catchup + 1).unwrap_or(i32::MAX);
        let mut span = self.settings.interval.saturating_mul(depth).max(Duration::SECOND);
        let missed = loop {
            let start = latest
                .timestamp
                .checked_sub(span)
                .map_or(floor, |t| t.max(floor));
            let missed: Vec<Reading> = store
                .range(start, latest.timestamp + Duration::SECOND)?
                .into_iter()
                .filter(|r| watermark.is_none_or(|w| r.timestamp > w))
                .dedupe_by_interval(self.settings.interval)
                .collect();
            if missed.len() >= self.settings.catchup || start == floor {
                break missed;
            }
            span = span.saturating_mul(2);
        };
        let skip = missed.len().saturating_sub(self.settings.catchup);
        Ok(missed.into_iter().skip(skip).collect())
    }

    /// Upload missed readings, oldest first, at most `catchup` of them.
    ///
    /// Each attempt waits out the interval since the previous one. The pass
    /// stops at the first failure so the watermark never skips a reading.
    pub async fn catch_up(&self) -> Vec<UploadAttempt> {
        if !self.settings.logged {
            return Vec::new();
        }
        let _guard = self.lock.lock().await;

        let pending = match self.pending() {
            Ok(pending) => pending,
            Err(e) => {
                warn!(destination = %self.id, "Failed to find missed readings: {}", e);
                return Vec::new();
            }
        };
        if pending.is_empty() {
            return Vec::new();
        }
        debug!(destination = %self.id, count = pending.len(), "Catching up");

        let mut attempts = Vec::with_capacity(pending.len());
        for reading in &pending {
            match self.status.upload_status(&self.id) {
                Ok(status) => {
                    if let Some(last) = status.last_attempt_at {
                        self.clock.sleep_until(last + self.settings.interval).await;
                    }
                }
                Err(e) => {
                    warn!(destination = %self.id, "Failed to read upload status: {}", e);
                    break;
                }
            }

            let attempt = self.attempt(reading, Mode::Logged).await;
            let stop = !attempt.outcome.is_success();
            attempts.push(attempt);
            if stop {
                break;
            }
        }
        attempts
    }

    /// One attempt regardless of throttle, for diagnosis.
    pub async fn upload_now(&self, reading: &Reading, mode: Mode) -> UploadAttempt {
        let _guard = self.lock.lock().await;
        self.attempt(reading, mode).await
    }

    /// Create or update this destination's remote identity and persist it.
    pub async fn register(&self) -> Result<String, UploadError> {
        let _guard = self.lock.lock().await;
        let existing = self.status.upload_status(&self.id)?.identity;
        self.register_identity(existing.as_deref()).await
    }

    async fn register_identity(&self, existing: Option<&str>) -> Result<String, UploadError> {
        match existing {
            Some(id) => info!(destination = %self.id, identity = id, "Updating remote identity"),
            None => info!(destination = %self.id, "Registering new remote identity"),
        }
        let identity = self.protocol.register(existing).await?;
        self.status.set_identity(&self.id, &identity)?;
        info!(destination = %self.id, identity = %identity, "Remote identity stored");
        Ok(identity)
    }

    /// The identity to upload with, registering first if the destination
    /// needs one and has none.
    async fn identity(&self) -> Result<Option<String>, UploadError> {
        if !self.protocol.needs_identity() {
            return Ok(None);
        }
        match self.status.upload_status(&self.id)?.identity {
            Some(identity) => Ok(Some(identity)),
            None => self.register_identity(None).await.map(Some),
        }
    }

    /// Run one attempt. The caller holds the destination lock.
    async fn attempt(&self, reading: &Reading, mode: Mode) -> UploadAttempt {
        let result = self.exchange(reading).await;
        let (outcome, state, message) = match result {
            Ok(ack) => {
                let message = match self.status.advance_watermark(&self.id, reading.timestamp) {
                    Ok(()) => ack,
                    Err(e) => {
                        warn!(destination = %self.id, "Failed to store watermark: {}", e);
                        format!("{} (watermark not stored: {})", ack, e)
                    }
                };
                (Outcome::Success, AttemptState::Closed, message)
            }
            Err((stage, e)) => {
                let kind = e.failure_kind();
                (
                    Outcome::from(kind),
                    AttemptState::Failed(kind),
                    format!("{}: {}", stage, e),
                )
            }
        };

        let attempt = UploadAttempt {
            destination: self.id.clone(),
            reading_at: reading.timestamp,
            mode,
            outcome,
            state,
            message,
        };
        attempt.log();
        attempt
    }

    /// Walk the session states. On failure reports the state being entered.
    async fn exchange(&self, reading: &Reading) -> Result<String, (AttemptState, UploadError)> {
        self.status
            .record_attempt(&self.id, self.clock.now())
            .map_err(|e| (AttemptState::Idle, e.into()))?;

        let identity = self
            .identity()
            .await
            .map_err(|e| (AttemptState::Idle, e))?;
        let fields = self.prepare(reading);

        let mut session = self
            .step(AttemptState::SessionOpen, self.protocol.open_session())
            .await?;

        let result = async {
            self.step(
                AttemptState::Authenticated,
                self.protocol.authenticate(&mut session),
            )
            .await?;
            self.step(
                AttemptState::Sent,
                self.protocol.send(&mut session, &fields, identity.as_deref()),
            )
            .await
        }
        .await;

        self.protocol.close(session).await;
        result
    }

    async fn step<T>(
        &self,
        stage: AttemptState,
        fut: impl Future<Output = Result<T, UploadError>>,
    ) -> Result<T, (AttemptState, UploadError)> {
        let after = self.settings.timeout;
        match tokio::time::timeout(after, fut).await {
            Ok(Ok(value)) => {
                debug!(destination = %self.id, state = %stage, "Session state");
                Ok(value)
            }
            Ok(Err(e)) => Err((stage, e)),
            Err(_) => Err((stage, UploadError::Timeout { stage, after })),
        }
    }
}

/// Object-safe view of an [`UploadService`], used by the dispatcher.
#[async_trait]
pub trait Uploader: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> &'static str;

    fn interval(&self) -> Duration;

    fn has_mode(&self, mode: Mode) -> bool;

    async fn upload_live(&self, reading: &Reading) -> Option<UploadAttempt>;

    async fn catch_up(&self) -> Vec<UploadAttempt>;

    async fn upload_now(&self, reading: &Reading, mode: Mode) -> UploadAttempt;

    async fn register(&self) -> Result<String, UploadError>;
}

#[async_trait]
impl<P: Protocol> Uploader for UploadService<P> {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &'static str {
        self.protocol.kind()
    }

    fn interval(&self) -> Duration {
        self.settings.interval
    }

    fn has_mode(&self, mode: Mode) -> bool {
        self.settings.has_mode(mode)
    }

    async fn upload_live(&self, reading: &Reading) -> Option<UploadAttempt> {
        UploadService::upload_live(self, reading).await
    }

    async fn catch_up(&self) -> Vec<UploadAttempt> {
        UploadService::catch_up(self).await
    }

    async fn upload_now(&self, reading: &Reading, mode: Mode) -> UploadAttempt {
        UploadService::upload_now(self, reading, mode).await
    }

    async fn register(&self) -> Result<String, UploadError> {
        UploadService::register(self).await
    }
}
