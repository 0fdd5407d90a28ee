//! Pacing of remote writes.
//!
//! The issue tracker penalises bursts twice: a secondary "abuse detection"
//! block on content creation, and the hourly primary quota. Every write is
//! followed by a pause chosen here.

use rand::Rng;
use std::time::Duration;
use tracing::{info, warn};

/// Kinds of write with different quota low-water marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Issue or comment creation.
    Create,
    /// Edits, closes and listing.
    Update,
}

/// Durations and thresholds used by [`Throttle`].
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Bounds of the pause after an abuse-detection rejection.
    pub abuse_backoff: (Duration, Duration),
    /// Bounds of the pause after a successful write.
    pub write_delay: (Duration, Duration),
    /// Pause when the remaining quota is low.
    pub quota_wait: Duration,
    /// Remaining quota below which creation waits for the quota to refill.
    pub create_low_water: u64,
    /// Remaining quota below which updates wait for the quota to refill.
    pub update_low_water: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            abuse_backoff: (Duration::from_secs(60), Duration::from_secs(120)),
            write_delay: (Duration::from_secs(5), Duration::from_secs(10)),
            quota_wait: Duration::from_secs(60 * 60),
            create_low_water: 10,
            update_low_water: 5,
        }
    }
}

impl ThrottleConfig {
    /// No pauses at all. Thresholds keep their defaults.
    pub fn disabled() -> Self {
        Self {
            abuse_backoff: (Duration::ZERO, Duration::ZERO),
            write_delay: (Duration::ZERO, Duration::ZERO),
            quota_wait: Duration::ZERO,
            ..Default::default()
        }
    }

    fn low_water(&self, kind: WriteKind) -> u64 {
        match kind {
            WriteKind::Create => self.create_low_water,
            WriteKind::Update => self.update_low_water,
        }
    }
}

/// Picks a duration uniformly between `min` and `max`.
pub fn random_duration(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let min_ms = min.as_millis() as u64;
    let max_ms = max.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
}

/// Applies a [`ThrottleConfig`].
#[derive(Debug, Clone, Default)]
pub struct Throttle {
    config: ThrottleConfig,
}

impl Throttle {
    /// Create a throttle.
    pub fn new(config: ThrottleConfig) -> Self {
        Self { config }
    }

    /// Settings in use.
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Wait after the tracker blocked content creation.
    pub async fn abuse_backoff(&self) {
        let (min, max) = self.config.abuse_backoff;
        let delay = random_duration(min, max);
        warn!(delay_secs = delay.as_secs(), "Abuse detection triggered, backing off");
        sleep(delay).await;
    }

    /// Wait for a rejected call whose quota resets in `secs` seconds.
    pub async fn rate_limited(&self, secs: u64) {
        let delay = Duration::from_secs(secs).min(self.config.quota_wait);
        warn!(delay_secs = delay.as_secs(), "Rate limit exceeded, waiting for reset");
        sleep(delay).await;
    }

    /// Pause after a successful write given the remaining quota.
    ///
    /// Returns true if the long quota wait was taken.
    pub async fn after_write(&self, remaining: u64, kind: WriteKind) -> bool {
        if self.quota_exhausted(remaining, kind).await {
            return true;
        }
        let (min, max) = self.config.write_delay;
        sleep(random_duration(min, max)).await;
        false
    }

    /// Pause after a read only if the remaining quota is low.
    pub async fn after_read(&self, remaining: u64) -> bool {
        self.quota_exhausted(remaining, WriteKind::Update).await
    }

    /// Pause between two bugs of a transfer.
    pub async fn between_bugs(&self) {
        let (min, max) = self.config.write_delay;
        sleep(random_duration(min, max)).await;
    }

    async fn quota_exhausted(&self, remaining: u64, kind: WriteKind) -> bool {
        if remaining >= self.config.low_water(kind) {
            return false;
        }
        info!(
            remaining,
            wait_secs = self.config.quota_wait.as_secs(),
            "Rate limit nearly exhausted, waiting"
        );
        sleep(self.config.quota_wait).await;
        info!("Quota wait elapsed, resuming");
        true
    }
}

async fn sleep(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_duration_bounds() {
        let min = Duration::from_secs(5);
        let max = Duration::from_secs(10);
        for _ in 0..100 {
            let d = random_duration(min, max);
            assert!(d >= min && d <= max);
        }
        assert_eq!(random_duration(max, min), max);
    }

    #[test]
    fn test_default_thresholds() {
        let config = ThrottleConfig::default();
        assert_eq!(config.low_water(WriteKind::Create), 10);
        assert_eq!(config.low_water(WriteKind::Update), 5);
        assert_eq!(config.quota_wait, Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_quota_waits_an_hour() {
        let throttle = Throttle::default();
        let start = tokio::time::Instant::now();
        assert!(throttle.after_write(9, WriteKind::Create).await);
        assert!(start.elapsed() >= Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_threshold_is_lower() {
        let throttle = Throttle::default();
        let start = tokio::time::Instant::now();
        assert!(!throttle.after_write(9, WriteKind::Update).await);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed <= Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_wait_is_capped() {
        let throttle = Throttle::default();
        let start = tokio::time::Instant::now();
        throttle.rate_limited(10 * 3600).await;
        assert!(start.elapsed() < Duration::from_secs(3601));
    }

    #[tokio::test]
    async fn test_disabled_never_sleeps() {
        let throttle = Throttle::new(ThrottleConfig::disabled());
        assert!(throttle.after_write(0, WriteKind::Create).await);
        assert!(!throttle.after_read(100).await);
        throttle.abuse_backoff().await;
    }
}
