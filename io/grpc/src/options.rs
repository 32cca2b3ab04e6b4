//! Per-call options.

use crate::cancel::CancellationToken;
use crate::credentials::CallCredentials;
use crate::metadata::Metadata;
use std::time::Duration;
use tokio::time::Instant;

/// Options for a single call.
///
/// A call without a deadline never times out locally and sends no
/// `grpc-timeout` header.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    headers: Metadata,
    deadline: Option<Instant>,
    cancellation: Option<CancellationToken>,
    credentials: Option<CallCredentials>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_headers(mut self, headers: Metadata) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key, value);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set the deadline relative to now. A timeout too large to represent
    /// leaves the call without a deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Instant::now().checked_add(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_credentials(mut self, credentials: CallCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn headers(&self) -> &Metadata {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut Metadata {
        &mut self.headers
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub fn set_cancellation(&mut self, token: Option<CancellationToken>) {
        self.cancellation = token;
    }

    pub fn credentials(&self) -> Option<&CallCredentials> {
        self.credentials.as_ref()
    }

    pub fn set_credentials(&mut self, credentials: Option<CallCredentials>) {
        self.credentials = credentials;
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}
