use std::time::{Duration, Instant};

/// Backoff configuration shared by all pause trackers of a runtime.
#[derive(Debug, Clone)]
pub struct PauseConfig {
    pub timeout: Duration,
    pub max_timeout: Duration,
    pub with_exponential_backoff: bool,
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_timeout: Duration::from_secs(30),
            with_exponential_backoff: true,
        }
    }
}

/// Per-partition pause state: how many consecutive failures were seen, how
/// long the current backoff window is and whether the pause was requested by
/// user code (manual pauses are never auto-resumed).
#[derive(Debug)]
pub struct PauseTracker {
    config: PauseConfig,
    attempt: u32,
    current_timeout: Duration,
    paused_until: Option<Instant>,
    manual: bool,
}

impl PauseTracker {
    pub fn new(config: PauseConfig) -> Self {
        let current_timeout = config.timeout;
        Self {
            config,
            attempt: 0,
            current_timeout,
            paused_until: None,
            manual: false,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    /// Record a failed attempt and open the next backoff window. Returns the
    /// window length so callers can log it.
    pub fn backoff(&mut self) -> Duration {
        self.attempt += 1;
        self.current_timeout = if self.config.with_exponential_backoff {
            let exponent = self.attempt.saturating_sub(1).min(31);
            self.config
                .timeout
                .saturating_mul(2u32.saturating_pow(exponent))
                .min(self.config.max_timeout)
        } else {
            self.config.timeout
        };
        self.paused_until = Some(Instant::now() + self.current_timeout);
        self.manual = false;
        self.current_timeout
    }

    /// Open a pause window of an explicit length.
    pub fn pause_for(&mut self, timeout: Duration) {
        self.paused_until = Some(Instant::now() + timeout);
    }

    /// Nominal pause: expires immediately, so the next resume tick lifts it
    /// and forces a re-fetch from the current position.
    pub fn pause_nominal(&mut self) {
        self.paused_until = Some(Instant::now());
    }

    /// Pause requested by user code; excluded from auto-resume.
    pub fn pause_manual(&mut self) {
        self.manual = true;
        self.paused_until = None;
    }

    pub fn manual(&self) -> bool {
        self.manual
    }

    pub fn paused(&self) -> bool {
        self.manual || self.paused_until.is_some()
    }

    /// True when a timed pause window has elapsed. Manual pauses never expire.
    pub fn expired(&self, now: Instant) -> bool {
        !self.manual && self.paused_until.is_some_and(|until| until <= now)
    }

    /// Close the current window without touching the attempt count.
    pub fn resume(&mut self) {
        self.paused_until = None;
        self.manual = false;
    }

    /// Reset on success: attempt count and window length return to their
    /// initial values. An open pause window is not touched; the resume tick
    /// lifts it.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_timeout = self.config.timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PauseTracker {
        PauseTracker::new(PauseConfig {
            timeout: Duration::from_millis(100),
            max_timeout: Duration::from_millis(400),
            with_exponential_backoff: true,
        })
    }

    #[test]
    fn test_backoff_grows_exponentially_with_cap() {
        let mut tracker = tracker();

        assert_eq!(tracker.backoff(), Duration::from_millis(100));
        assert_eq!(tracker.backoff(), Duration::from_millis(200));
        assert_eq!(tracker.backoff(), Duration::from_millis(400));
        // Capped at max_timeout from here on.
        assert_eq!(tracker.backoff(), Duration::from_millis(400));
        assert_eq!(tracker.attempt(), 4);
    }

    #[test]
    fn test_reset_restores_attempt_and_timeout() {
        let mut tracker = tracker();
        tracker.backoff();
        tracker.backoff();
        assert_eq!(tracker.attempt(), 2);

        tracker.reset();
        assert_eq!(tracker.attempt(), 0);
        assert_eq!(tracker.current_timeout(), Duration::from_millis(100));
        // The open window survives the reset; only the resume tick lifts it.
        assert!(tracker.paused());

        tracker.resume();
        assert!(!tracker.paused());
    }

    #[test]
    fn test_linear_backoff_keeps_base_timeout() {
        let mut tracker = PauseTracker::new(PauseConfig {
            timeout: Duration::from_millis(50),
            max_timeout: Duration::from_millis(400),
            with_exponential_backoff: false,
        });

        assert_eq!(tracker.backoff(), Duration::from_millis(50));
        assert_eq!(tracker.backoff(), Duration::from_millis(50));
    }

    #[test]
    fn test_nominal_pause_expires_immediately() {
        let mut tracker = tracker();
        tracker.pause_nominal();
        assert!(tracker.paused());
        assert!(tracker.expired(Instant::now()));
    }

    #[test]
    fn test_manual_pause_never_expires() {
        let mut tracker = tracker();
        tracker.pause_manual();
        assert!(tracker.paused());
        assert!(tracker.manual());
        assert!(!tracker.expired(Instant::now() + Duration::from_secs(3600)));

        tracker.resume();
        assert!(!tracker.paused());
        assert!(!tracker.manual());
    }

    #[test]
    fn test_timed_pause_expiry() {
        let mut tracker = tracker();
        let opened = tracker.backoff();
        assert!(!tracker.expired(Instant::now()));
        assert!(tracker.expired(Instant::now() + opened + Duration::from_millis(10)));
    }
}
