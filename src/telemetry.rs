use crate::reply::ReplySource;
use crate::speaker_box::{Outcome, SpeakResult};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Measures one stage in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    Queued,
    LeaseAcquired,
    Normalizing,
    Segmenting,
    Synthesizing,
    Completed,
    Failed,
    Rejected,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Completed
                | RequestState::Failed
                | RequestState::Rejected
                | RequestState::Cancelled
        )
    }
}

/// Tracks and logs the lifecycle of one request.
#[derive(Debug)]
pub struct RequestTrace {
    request_id: String,
    state: RequestState,
}

impl RequestTrace {
    pub fn new(request_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        debug!(%request_id, state = ?RequestState::Received, "request received");
        Self {
            request_id,
            state: RequestState::Received,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn advance(&mut self, next: RequestState) {
        if self.state.is_terminal() {
            warn!(request_id = %self.request_id, from = ?self.state, to = ?next, "transition after terminal state ignored");
            return;
        }
        debug!(request_id = %self.request_id, from = ?self.state, to = ?next, "request state");
        self.state = next;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TelemetrySnapshot {
    pub requests: u64,
    pub played: u64,
    pub not_played: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub rejected: u64,
    pub dry_runs: u64,
    pub fallback_replies: u64,
    pub last_total_ms: u64,
}

#[derive(Debug, Default)]
pub struct Telemetry {
    requests: AtomicU64,
    played: AtomicU64,
    not_played: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    dry_runs: AtomicU64,
    fallback_replies: AtomicU64,
    last_total_ms: AtomicU64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs the result as one JSON line and updates the counters.
    pub fn record(&self, result: &SpeakResult) {
        match serde_json::to_string(result) {
            Ok(json) => info!(request_id = %result.request_id, result = %json, "speak result"),
            Err(e) => warn!(request_id = %result.request_id, error = %e, "failed to serialize result"),
        }

        self.requests.fetch_add(1, Ordering::Relaxed);
        let counter = match result.outcome {
            Outcome::Played => &self.played,
            Outcome::NotPlayed => &self.not_played,
            Outcome::Cancelled => &self.cancelled,
            Outcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        if result.dry_run {
            self.dry_runs.fetch_add(1, Ordering::Relaxed);
        }
        if result.reply_source == ReplySource::Fallback {
            self.fallback_replies.fetch_add(1, Ordering::Relaxed);
        }
        self.last_total_ms
            .store(result.latency_ms.total_ms, Ordering::Relaxed);
    }

    pub fn record_rejection(&self, reason: &str) {
        info!(reason, "request rejected");
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            played: self.played.load(Ordering::Relaxed),
            not_played: self.not_played.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dry_runs: self.dry_runs.load(Ordering::Relaxed),
            fallback_replies: self.fallback_replies.load(Ordering::Relaxed),
            last_total_ms: self.last_total_ms.load(Ordering::Relaxed),
        }
    }
}
