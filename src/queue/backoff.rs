//! Retry backoff for failed jobs.
//!
//! Formula is pinned to `min(max_secs, base_secs * 2^attempts)`: deterministic
//! rather than jittered, since the schedule is persisted in `jobs.scheduled_at`
//! and must reproduce the same delay if the daemon restarts mid-retry.

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base_secs: u64,
    pub max_secs: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_secs: 1,
            max_secs: 60,
        }
    }
}

impl Backoff {
    /// Delay before the next attempt, given `attempts` already made (1-indexed
    /// — `attempts` as stored on the job row right after a claim increments it).
    pub fn delay_secs(&self, attempts: i64) -> u64 {
        let exp = attempts.max(0).min(32) as u32;
        let raw = self.base_secs.saturating_mul(1u64 << exp);
        raw.min(self.max_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_capped() {
        let b = Backoff::default();
        assert_eq!(b.delay_secs(0), 1);
        assert_eq!(b.delay_secs(1), 2);
        assert_eq!(b.delay_secs(2), 4);
        assert_eq!(b.delay_secs(6), 60); // 64 capped to 60
        assert_eq!(b.delay_secs(20), 60);
    }
}
