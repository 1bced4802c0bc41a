use rand::{thread_rng, Rng};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Linear,
    Exponential,
}

/// Bounded reconnect schedule: attempt `n` waits `delay(n)`, and `None` means give up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    pub kind: BackoffKind,
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff { kind: BackoffKind::Linear, base_ms: 1000, max_ms: 30_000, max_attempts: 5, jitter: false }
    }
}

impl Backoff {
    pub fn linear(base: Duration, max_attempts: u32) -> Self {
        Backoff { kind: BackoffKind::Linear, base_ms: base.as_millis() as u64, max_attempts, ..Backoff::default() }
    }

    pub fn exponential(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Backoff {
            kind: BackoffKind::Exponential,
            base_ms: base.as_millis() as u64,
            max_ms: max.as_millis() as u64,
            max_attempts,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the 1-based `attempt`, or `None` once attempts are exhausted.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let raw = match self.kind {
            BackoffKind::Linear => self.base_ms.saturating_mul(attempt as u64),
            BackoffKind::Exponential => self.base_ms.saturating_mul(1u64 << (attempt - 1).min(16)),
        };
        let capped = raw.min(self.max_ms);
        let jitter = if self.jitter { thread_rng().gen_range(0..(capped / 4 + 1)) } else { 0 };
        Some(Duration::from_millis((capped + jitter).min(self.max_ms)))
    }

    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.max_attempts).filter_map(move |a| self.delay(a))
    }
}
