//! Generic cell rate algorithm.
//!
//! Only the theoretical arrival time (TAT) of the next token is stored. One
//! token is emitted every `period / limit`; `burst` extra tokens may be taken
//! at once when the bucket has been idle.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gcra {
    pub limit: i64,
    pub burst: i64,
    pub period_ms: i64,
}

impl Gcra {
    pub fn new(limit: i64, burst: i64, period_ms: i64) -> Self {
        Self {
            limit,
            burst,
            period_ms,
        }
    }

    /// Milliseconds between two tokens. Zero when the limiter is disabled.
    pub fn emission_interval_ms(&self) -> i64 {
        if self.limit <= 0 || self.period_ms <= 0 {
            return 0;
        }
        (self.period_ms / self.limit).max(1)
    }

    fn tolerance_ms(&self) -> i64 {
        self.emission_interval_ms() * (self.burst.max(0) + 1)
    }

    /// Tokens available at `now_ms` given the stored TAT.
    pub fn capacity(&self, now_ms: i64, stored_tat_ms: Option<i64>) -> i64 {
        let t = self.emission_interval_ms();
        if t == 0 {
            return i64::MAX;
        }
        let tat = stored_tat_ms.unwrap_or(now_ms).max(now_ms);
        ((now_ms + self.tolerance_ms() - tat) / t).max(0)
    }

    /// New TAT after taking `tokens` at `now_ms`.
    pub fn consume(&self, now_ms: i64, stored_tat_ms: Option<i64>, tokens: i64) -> i64 {
        let tat = stored_tat_ms.unwrap_or(now_ms).max(now_ms);
        tat + self.emission_interval_ms() * tokens.max(0)
    }

    /// Earliest time at which one more token becomes available.
    pub fn retry_at(&self, now_ms: i64, stored_tat_ms: Option<i64>) -> i64 {
        let t = self.emission_interval_ms();
        let tat = stored_tat_ms.unwrap_or(now_ms).max(now_ms);
        (tat - self.tolerance_ms() + t).max(now_ms)
    }

    /// How long the stored TAT stays relevant; after this the bucket is full again.
    pub fn ttl_ms(&self, tat_ms: i64, now_ms: i64) -> i64 {
        (tat_ms - now_ms).max(0) + self.tolerance_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: i64 = 60_000;

    #[test]
    fn one_per_minute_without_burst() {
        let g = Gcra::new(1, 0, MINUTE);
        let now = 1_000_000;
        assert_eq!(g.capacity(now, None), 1);
        let tat = g.consume(now, None, 1);
        assert_eq!(g.capacity(now, Some(tat)), 0);
        assert_eq!(g.retry_at(now, Some(tat)), now + MINUTE);
        assert_eq!(g.capacity(now + MINUTE - 1, Some(tat)), 0);
        assert_eq!(g.capacity(now + MINUTE, Some(tat)), 1);
    }

    #[test]
    fn burst_allows_extra_tokens_when_idle() {
        let g = Gcra::new(10, 5, MINUTE);
        let now = 50_000_000;
        assert_eq!(g.capacity(now, None), 6);
        let tat = g.consume(now, None, 6);
        assert_eq!(g.capacity(now, Some(tat)), 0);
        // one emission interval later exactly one token is back
        assert_eq!(g.capacity(now + 6_000, Some(tat)), 1);
    }

    #[test]
    fn disabled_limiter_is_unbounded() {
        let g = Gcra::new(0, 0, MINUTE);
        assert_eq!(g.capacity(0, Some(1_000_000)), i64::MAX);
    }
}
