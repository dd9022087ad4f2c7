// ── Reconnect backoff ──
//
// Exponential delay with up to +25% jitter, applied before the cap so that
// successive delays strictly increase until they reach `max_delay`.

use std::time::Duration;

/// Exponential backoff configuration for change-feed reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum consecutive failed attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

/// Stateful backoff: one per reconnect loop.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: ReconnectConfig,
    attempt: u32,
    seed: f64,
}

impl ExponentialBackoff {
    pub fn new(config: ReconnectConfig) -> Self {
        // Per-instance phase so independent loops do not reconnect in lockstep.
        let bits = uuid::Uuid::new_v4().as_u128() & 0xFFFF;
        Self {
            config,
            attempt: 0,
            seed: f64::from(u16::try_from(bits).unwrap_or_default()),
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// `true` once `max_retries` consecutive attempts have failed.
    pub fn exhausted(&self) -> bool {
        self.config
            .max_retries
            .is_some_and(|max| self.attempt >= max)
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Back to the initial delay. Called after any successful message.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.min(62)).unwrap_or(62);
        let base = self.config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);

        // Deterministic jitter in [0, 0.25), seeded per instance.
        let jitter = 0.25 * (f64::from(attempt) * 7.3 + self.seed).sin().abs();
        let with_jitter = base * (1.0 + jitter);

        let capped = with_jitter.min(self.config.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

// ── Tests ────────────────────────────────────────────────────────────
