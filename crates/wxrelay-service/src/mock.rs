//! Mock protocol for testing.
//!
//! [`MockProtocol`] implements [`Protocol`] without any network I/O so the
//! upload state machine and the dispatcher can be exercised directly.
//!
//! # Features
//!
//! - **Failure injection**: fail the next attempt, or every attempt after
//!   a number of successes, at a chosen session step
//! - **Latency simulation**: delay `send` to hold a destination busy
//! - **Recording**: every delivered payload is kept for inspection

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use wxrelay_core::{FieldSpec, Format, Metric, Resolved, Selector, TemplateContext, TimeFormat};
use wxrelay_types::Field;

use crate::error::UploadError;
use crate::upload::Protocol;

/// Fields rendered by the mock.
pub const MOCK_TEMPLATE: &[FieldSpec] = &[
    FieldSpec::new("dt", Selector::Time(TimeFormat::Unix), Format::Integer),
    FieldSpec::new("temperature", Selector::Field(Field::TempOut), Format::Fixed(1)),
    FieldSpec::new("rain_1h", Selector::Derived(Metric::RainHour), Format::Fixed(1)),
];

/// Where an injected failure happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Connection refused while opening the session.
    Connect,
    /// Credentials rejected.
    Auth,
    /// HTTP 503 on send.
    ServerError,
    /// HTTP 400 on send.
    BadRequest,
    /// `send` never completes.
    Hang,
}

/// Session handed out by [`MockProtocol`].
#[derive(Debug)]
pub struct MockSession {
    pub id: u32,
    failure: Option<MockFailure>,
}

/// A protocol that records instead of sending.
pub struct MockProtocol {
    needs_identity: bool,
    sent: Mutex<Vec<(Resolved, Option<String>)>>,
    opened: AtomicU32,
    closed: AtomicU32,
    registrations: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    /// Failures consumed one per attempt, front first.
    planned: Mutex<VecDeque<Option<MockFailure>>>,
    /// Failure for every attempt once `planned` is empty.
    steady: Mutex<Option<MockFailure>>,
    /// Simulated send latency in milliseconds (0 = no delay).
    send_latency_ms: AtomicU64,
}

impl std::fmt::Debug for MockProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProtocol")
            .field("needs_identity", &self.needs_identity)
            .field("opened", &self.opened.load(Ordering::Relaxed))
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for MockProtocol {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProtocol {
    pub fn new() -> Self {
        Self {
            needs_identity: false,
            sent: Mutex::new(Vec::new()),
            opened: AtomicU32::new(0),
            closed: AtomicU32::new(0),
            registrations: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            planned: Mutex::new(VecDeque::new()),
            steady: Mutex::new(None),
            send_latency_ms: AtomicU64::new(0),
        }
    }

    /// Require a registered identity before uploading.
    pub fn with_identity(mut self) -> Self {
        self.needs_identity = true;
        self
    }

    /// Fail only the next attempt.
    pub fn fail_next(&self, failure: MockFailure) {
        self.planned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Some(failure));
    }

    /// Let `successes` attempts through, then fail every attempt.
    pub fn fail_after(&self, successes: usize, failure: MockFailure) {
        let mut planned = self.planned.lock().unwrap_or_else(|e| e.into_inner());
        planned.extend(std::iter::repeat_n(None, successes));
        *self.steady.lock().unwrap_or_else(|e| e.into_inner()) = Some(failure);
    }

    /// Stop failing.
    pub fn heal(&self) {
        self.planned.lock().unwrap_or_else(|e| e.into_inner()).clear();
        *self.steady.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn set_send_latency(&self, latency: Duration) {
        self.send_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Payloads delivered so far, with the identity they were sent under.
    pub fn sent(&self) -> Vec<(Resolved, Option<String>)> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn opened_sessions(&self) -> u32 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn closed_sessions(&self) -> u32 {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn registrations(&self) -> u32 {
        self.registrations.load(Ordering::Relaxed)
    }

    /// Highest number of sessions that were open at the same time.
    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::Relaxed)
    }

    fn next_failure(&self) -> Option<MockFailure> {
        let planned = self
            .planned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match planned {
            Some(failure) => failure,
            None => *self.steady.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

#[async_trait]
impl Protocol for MockProtocol {
    type Session = MockSession;

    fn kind(&self) -> &'static str {
        "mock"
    }

    fn template(&self) -> &'static [FieldSpec] {
        MOCK_TEMPLATE
    }

    fn context(&self) -> TemplateContext {
        TemplateContext::default()
    }

    fn needs_identity(&self) -> bool {
        self.needs_identity
    }

    async fn open_session(&self) -> Result<MockSession, UploadError> {
        let failure = self.next_failure();
        if failure == Some(MockFailure::Connect) {
            return Err(UploadError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "mock connection refused",
            )));
        }
        let id = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        Ok(MockSession { id, failure })
    }

    async fn authenticate(&self, session: &mut MockSession) -> Result<(), UploadError> {
        if session.failure == Some(MockFailure::Auth) {
            return Err(UploadError::AuthRejected("mock credentials refused".into()));
        }
        Ok(())
    }

    async fn send(
        &self,
        session: &mut MockSession,
        fields: &Resolved,
        identity: Option<&str>,
    ) -> Result<String, UploadError> {
        let latency = self.send_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        match session.failure {
            Some(MockFailure::ServerError) => {
                return Err(UploadError::Status {
                    status: 503,
                    body: "mock unavailable".into(),
                });
            }
            Some(MockFailure::BadRequest) => {
                return Err(UploadError::Status {
                    status: 400,
                    body: "mock bad request".into(),
                });
            }
            Some(MockFailure::Hang) => std::future::pending::<()>().await,
            _ => {}
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((fields.clone(), identity.map(str::to_string)));
        Ok(format!("OK (session {})", session.id))
    }

    async fn close(&self, _session: MockSession) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    async fn register(&self, existing: Option<&str>) -> Result<String, UploadError> {
        if !self.needs_identity {
            return Err(UploadError::RegistrationUnsupported(self.kind()));
        }
        let n = self.registrations.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(match existing {
            Some(identity) => identity.to_string(),
            None => format!("mock-{}", n),
        })
    }
}
