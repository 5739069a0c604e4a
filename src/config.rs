//! Environment-backed configuration for the multiplexer
//!
//! Every timing constant the components rely on lives here as a constructor
//! input with the observed defaults, instead of being a literal inside a
//! component.

use std::env;
use std::time::Duration;

/// Subsystem configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub typing: TypingConfig,
    pub presence: PresenceConfig,
    pub call: CallConfig,
    pub subscribe: SubscribeConfig,
}

/// Typing indicator tuning.
#[derive(Debug, Clone)]
pub struct TypingConfig {
    /// Minimum gap between two `typing_start` broadcasts for the same room.
    pub debounce_ms: u64,
    /// How long a remote typing indicator survives without a refresh.
    pub ttl_ms: u64,
    /// Interval of the sweep that evicts expired typing entries.
    pub sweep_interval_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1_500,
            // debounce plus margin, so continuous typing refreshes in time
            ttl_ms: 2_000,
            sweep_interval_ms: 500,
        }
    }
}

impl TypingConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Presence tuning.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Idle time after which an online peer reads as away.
    pub away_threshold_ms: u64,
    /// Interval of the local presence re-track heartbeat.
    pub heartbeat_interval_ms: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            away_threshold_ms: 60_000,
            heartbeat_interval_ms: 30_000,
        }
    }
}

impl PresenceConfig {
    pub fn away_threshold(&self) -> Duration {
        Duration::from_millis(self.away_threshold_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Call signaling tuning.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long an incoming offer stays pending before it times out as
    /// unanswered.
    pub answer_timeout_ms: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            answer_timeout_ms: 30_000,
        }
    }
}

impl CallConfig {
    pub fn answer_timeout(&self) -> Duration {
        Duration::from_millis(self.answer_timeout_ms)
    }
}

/// Channel subscribe retry tuning.
#[derive(Debug, Clone)]
pub struct SubscribeConfig {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for SubscribeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            typing: TypingConfig {
                debounce_ms: env_u64("TYPING_DEBOUNCE_MS", 1_500),
                ttl_ms: env_u64("TYPING_TTL_MS", 2_000),
                sweep_interval_ms: env_u64("TYPING_SWEEP_INTERVAL_MS", 500),
            },
            presence: PresenceConfig {
                away_threshold_ms: env_u64("PRESENCE_AWAY_THRESHOLD_MS", 60_000),
                heartbeat_interval_ms: env_u64("PRESENCE_HEARTBEAT_MS", 30_000),
            },
            call: CallConfig {
                answer_timeout_ms: env_u64("CALL_ANSWER_TIMEOUT_MS", 30_000),
            },
            subscribe: SubscribeConfig {
                max_attempts: env_u64("SUBSCRIBE_MAX_ATTEMPTS", 3) as u32,
                backoff_base_ms: env_u64("SUBSCRIBE_BACKOFF_BASE_MS", 250),
                backoff_max_ms: env_u64("SUBSCRIBE_BACKOFF_MAX_MS", 5_000),
            },
        }
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
