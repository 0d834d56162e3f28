//! Bounded-time liveness checks against candidate targets

use crate::pool::ConnectionPool;
use crate::resolver::TargetDescriptor;
use hyper::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Result of probing a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The target answered; any status counts, including errors from the app
    Reachable(StatusCode),
    /// Nothing usable answered: the service is treated as not yet provisioned
    NotProvisioned { status: StatusCode, reason: String },
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable(_))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ProbeOutcome::Reachable(status) => *status,
            ProbeOutcome::NotProvisioned { status, .. } => *status,
        }
    }
}

/// Issues a GET to the health endpoint of a target with a fixed timeout
pub struct LivenessProber {
    pool: Arc<ConnectionPool>,
    path: String,
    timeout: Duration,
}

impl LivenessProber {
    pub fn new(pool: Arc<ConnectionPool>, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            pool,
            path: path.into(),
            timeout,
        }
    }

    /// Probe the target.
    ///
    /// Transport failures, timeouts and a `502` answer all classify as
    /// [`ProbeOutcome::NotProvisioned`] with status `502`.
    pub async fn probe(&self, target: &TargetDescriptor) -> ProbeOutcome {
        let result = tokio::time::timeout(self.timeout, self.pool.probe(target, &self.path)).await;

        let outcome = match result {
            Ok(Ok(status)) if status == StatusCode::BAD_GATEWAY => ProbeOutcome::NotProvisioned {
                status: StatusCode::BAD_GATEWAY,
                reason: "target answered 502 Bad Gateway".to_string(),
            },
            Ok(Ok(status)) => ProbeOutcome::Reachable(status),
            Ok(Err(e)) => ProbeOutcome::NotProvisioned {
                status: StatusCode::BAD_GATEWAY,
                reason: e.to_string(),
            },
            Err(_) => ProbeOutcome::NotProvisioned {
                status: StatusCode::BAD_GATEWAY,
                reason: format!("no answer within {} seconds", self.timeout.as_secs()),
            },
        };

        debug!(
            host = %target.host,
            reachable = outcome.is_reachable(),
            status = outcome.status().as_u16(),
            "Liveness probe finished"
        );

        outcome
    }
}
