//! Reconnect policy for the signal channel
//!
//! A pure state machine: callers feed it connection outcomes and the current
//! time, it answers when to retry or that it has given up. No timers live
//! here, so the supervisor owns all sleeping.

use std::time::Duration;
use tokio::time::Instant;

/// Backoff never exceeds this
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Exponent cap for the backoff doubling
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// What to do after a connection was lost or an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Try again at `at`; this will be attempt number `attempt`
    RetryAt { attempt: u32, at: Instant },
    /// Out of attempts
    GiveUp { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base_interval: Duration,
    max_attempts: u32,
    attempt: u32,
    next_retry_at: Option<Instant>,
}

impl ReconnectPolicy {
    pub fn new(base_interval: Duration, max_attempts: u32) -> Self {
        Self {
            base_interval,
            max_attempts,
            attempt: 0,
            next_retry_at: None,
        }
    }

    /// Attempts made since the last successful connection
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.next_retry_at
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Exponential backoff before the given 1-based attempt, capped at 60s
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let base_ms = self.base_interval.as_millis() as u64;
        let backoff_ms = base_ms.saturating_mul(2u64.pow(exponent));
        Duration::from_millis(backoff_ms).min(MAX_BACKOFF)
    }

    /// The connection dropped, or a reconnect attempt failed
    pub fn on_connection_lost(&mut self, now: Instant) -> ReconnectDecision {
        if self.is_exhausted() {
            self.next_retry_at = None;
            return ReconnectDecision::GiveUp {
                attempts: self.attempt,
            };
        }
        self.attempt += 1;
        let at = now + self.backoff_duration(self.attempt);
        self.next_retry_at = Some(at);
        ReconnectDecision::RetryAt {
            attempt: self.attempt,
            at,
        }
    }

    /// Whether a scheduled retry is due
    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.next_retry_at, Some(at) if now >= at)
    }

    /// A connection succeeded
    pub fn on_connected(&mut self) {
        self.attempt = 0;
        self.next_retry_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy::new(Duration::from_secs(1), max_attempts)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.backoff_duration(1), Duration::from_secs(1));
        assert_eq!(p.backoff_duration(2), Duration::from_secs(2));
        assert_eq!(p.backoff_duration(3), Duration::from_secs(4));
        assert_eq!(p.backoff_duration(6), Duration::from_secs(32));
        assert_eq!(p.backoff_duration(9), Duration::from_secs(32));

        let slow = ReconnectPolicy::new(Duration::from_secs(5), 10);
        assert_eq!(slow.backoff_duration(6), MAX_BACKOFF);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut p = policy(3);
        let now = Instant::now();

        for expected in 1..=3 {
            match p.on_connection_lost(now) {
                ReconnectDecision::RetryAt { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(p.is_exhausted());
        assert_eq!(
            p.on_connection_lost(now),
            ReconnectDecision::GiveUp { attempts: 3 }
        );
        assert!(p.next_retry_at().is_none());
    }

    #[test]
    fn test_success_resets_counter() {
        let mut p = policy(3);
        let now = Instant::now();
        p.on_connection_lost(now);
        p.on_connection_lost(now);
        assert_eq!(p.attempt(), 2);

        p.on_connected();

        assert_eq!(p.attempt(), 0);
        assert!(p.next_retry_at().is_none());
        assert!(matches!(
            p.on_connection_lost(now),
            ReconnectDecision::RetryAt { attempt: 1, .. }
        ));
    }

    #[test]
    fn test_retry_due_after_backoff() {
        let mut p = policy(3);
        let now = Instant::now();
        let ReconnectDecision::RetryAt { at, .. } = p.on_connection_lost(now) else {
            panic!("expected retry");
        };

        assert_eq!(at, now + Duration::from_secs(1));
        assert!(!p.is_due(now));
        assert!(p.is_due(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_zero_attempts_gives_up_immediately() {
        let mut p = policy(0);
        assert_eq!(
            p.on_connection_lost(Instant::now()),
            ReconnectDecision::GiveUp { attempts: 0 }
        );
    }
}
