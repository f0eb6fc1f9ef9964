//! Politeness delay gate between extractor calls.
//!
//! The limiter spaces successive calls by a jittered delay derived from
//! a target request rate, clamped to `[min_delay, max_delay]`. It is a
//! single logical actor: concurrent callers queue behind one lock, so
//! spacing holds across every pipeline sharing the limiter.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ConfigError;

/// Lower and upper bound of the jitter factor applied to the base delay.
const JITTER: (f64, f64) = (0.8, 1.2);

/// Rate and delay bounds for a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Target rate. Non-positive rates fall back to `min_delay`.
    pub requests_per_second: f64,

    /// Shortest allowed spacing
    #[serde(with = "crate::types::secs")]
    pub min_delay: Duration,

    /// Longest allowed spacing
    #[serde(with = "crate::types::secs")]
    pub max_delay: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 0.5,
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RateLimitConfig {
    pub fn new(requests_per_second: f64, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            requests_per_second,
            min_delay,
            max_delay,
        }
    }

    /// Limiter used by a batch that enables rate limiting without
    /// supplying its own: 0.5 rps clamped to 5-10s.
    pub fn batch_default() -> Self {
        Self::new(0.5, Duration::from_secs(5), Duration::from_secs(10))
    }

    /// Un-jittered spacing, in seconds.
    fn base_secs(&self) -> f64 {
        if self.requests_per_second > 0.0 {
            1.0 / self.requests_per_second
        } else {
            self.min_delay.as_secs_f64()
        }
    }

    fn clamp(&self, secs: f64) -> Duration {
        let secs = secs
            .min(self.max_delay.as_secs_f64())
            .max(self.min_delay.as_secs_f64());
        Duration::try_from_secs_f64(secs).unwrap_or(self.min_delay)
    }

    /// Delay for the next call: base spacing times a random factor in
    /// [0.8, 1.2], clamped to the configured bounds.
    pub fn get_delay(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(JITTER.0..=JITTER.1);
        self.clamp(self.base_secs() * factor)
    }

    /// Clamped spacing without jitter.
    pub fn mean_delay(&self) -> Duration {
        self.clamp(self.base_secs())
    }
}

/// Named rate-limit configurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitPreset {
    /// No gate at all
    None,
    /// 1 rps, 1-2s
    Aggressive,
    /// 0.5 rps, 2-4s
    Normal,
    /// 0.2 rps, 5-10s
    Polite,
}

impl RateLimitPreset {
    pub const ALL: [RateLimitPreset; 4] = [
        RateLimitPreset::None,
        RateLimitPreset::Aggressive,
        RateLimitPreset::Normal,
        RateLimitPreset::Polite,
    ];

    /// The preset's configuration, or `None` when the gate is disabled.
    pub fn config(self) -> Option<RateLimitConfig> {
        let secs = Duration::from_secs;
        match self {
            RateLimitPreset::None => None,
            RateLimitPreset::Aggressive => Some(RateLimitConfig::new(1.0, secs(1), secs(2))),
            RateLimitPreset::Normal => Some(RateLimitConfig::new(0.5, secs(2), secs(4))),
            RateLimitPreset::Polite => Some(RateLimitConfig::new(0.2, secs(5), secs(10))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RateLimitPreset::None => "none",
            RateLimitPreset::Aggressive => "aggressive",
            RateLimitPreset::Normal => "normal",
            RateLimitPreset::Polite => "polite",
        }
    }
}

impl fmt::Display for RateLimitPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitPreset {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == name)
            .ok_or_else(|| ConfigError::UnknownName {
                kind: "rate limit preset",
                name: s.to_string(),
            })
    }
}

/// Snapshot of limiter activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub total_calls: u64,

    /// Wall-clock time of the last call
    pub last_call_time: Option<DateTime<Utc>>,

    /// Configured mean spacing
    #[serde(with = "crate::types::secs")]
    pub mean_delay: Duration,
}

#[derive(Default)]
struct LimiterState {
    last_call: Option<Instant>,
    last_call_time: Option<DateTime<Utc>>,
    total_calls: u64,
}

/// Jittered delay gate.
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState::default()),
        }
    }

    /// Build a limiter for a preset. `None` disables the gate.
    pub fn from_preset(preset: RateLimitPreset) -> Option<Self> {
        preset.config().map(Self::new)
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Wait until the next call is allowed.
    ///
    /// The first call never waits and returns zero. Later calls return
    /// the required delay when they had to sleep, or the time actually
    /// elapsed since the previous call when they did not.
    pub async fn wait(&self) -> Duration {
        // Held across the sleep so callers are spaced one after another
        let mut state = self.state.lock().await;

        let waited = match state.last_call {
            None => Duration::ZERO,
            Some(last) => {
                let elapsed = last.elapsed();
                let required = self.config.get_delay();
                if elapsed < required {
                    let remaining = required - elapsed;
                    debug!(
                        delay_ms = remaining.as_millis() as u64,
                        "Rate limiter sleeping"
                    );
                    tokio::time::sleep(remaining).await;
                    required
                } else {
                    elapsed
                }
            }
        };

        state.last_call = Some(Instant::now());
        state.last_call_time = Some(Utc::now());
        state.total_calls += 1;

        waited
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock().await;
        RateLimiterStats {
            total_calls: state.total_calls,
            last_call_time: state.last_call_time,
            mean_delay: self.config.mean_delay(),
        }
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
