//! Backoff schedule and the escalation decision for failed outbox entries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::dead_letter::DeadLetterReason;
use crate::model::UnixTimeMs;

/// Why a transmission attempt failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// No reachable peer, a send timeout, or no acknowledgment in time.
    TransientTransport,
    ChecksumMismatch,
    PeerRejected,
    ConflictUnresolvable,
}

impl FailureKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TransientTransport => "TRANSIENT_TRANSPORT",
            Self::ChecksumMismatch => "CHECKSUM_MISMATCH",
            Self::PeerRejected => "PEER_REJECTED",
            Self::ConflictUnresolvable => "CONFLICT_UNRESOLVABLE",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "TRANSIENT_TRANSPORT" => Some(Self::TransientTransport),
            "CHECKSUM_MISMATCH" => Some(Self::ChecksumMismatch),
            "PEER_REJECTED" => Some(Self::PeerRejected),
            "CONFLICT_UNRESOLVABLE" => Some(Self::ConflictUnresolvable),
            _ => None,
        }
    }

    #[must_use]
    pub const fn dead_letter_reason(self) -> DeadLetterReason {
        match self {
            Self::TransientTransport => DeadLetterReason::TransientTransportExhausted,
            Self::ChecksumMismatch => DeadLetterReason::ChecksumMismatch,
            Self::PeerRejected => DeadLetterReason::PeerRejected,
            Self::ConflictUnresolvable => DeadLetterReason::ConflictUnresolvable,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Record the failure and try again once `delay` has elapsed.
    Retry { retry_count: u32, delay: Duration },
    /// The ceiling is reached; quarantine the entry.
    Escalate { failure_count: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 100,
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// `base * 2^n`.
    #[must_use]
    pub fn delay(&self, n: u32) -> Duration {
        let exponent = n.min(31);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << exponent))
    }

    /// Decides what happens to an entry that has already failed
    /// `retry_count` times and just failed again.
    #[must_use]
    pub fn on_failure(&self, retry_count: u32) -> RetryDecision {
        if retry_count >= self.max_retries {
            return RetryDecision::Escalate {
                failure_count: retry_count.saturating_add(1),
            };
        }
        RetryDecision::Retry {
            retry_count: retry_count + 1,
            delay: self.delay(retry_count),
        }
    }

    /// When an entry with `retry_count` recorded failures becomes eligible
    /// again.
    #[must_use]
    pub fn next_attempt_at(&self, last_attempt_at: UnixTimeMs, retry_count: u32) -> UnixTimeMs {
        let delay = self.delay(retry_count.saturating_sub(1));
        last_attempt_at.add_millis(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
    }

    #[must_use]
    pub fn is_due(&self, last_attempt_at: UnixTimeMs, retry_count: u32, now: UnixTimeMs) -> bool {
        now >= self.next_attempt_at(last_attempt_at, retry_count)
    }
}
