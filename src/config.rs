//! Session and generation settings parsed from environment variables.
//!
//! DESIGN
//! ======
//! Read-only from the core's perspective: `main` builds one `Settings` at
//! startup and hands it to `AppState`. Parsing goes through a lookup
//! function so tests can feed a map instead of mutating the process env.

use std::time::Duration;

use rand::Rng;

pub const DEFAULT_SESSION_DURATION_MINUTES: u64 = 10;
pub const DEFAULT_EXTENSION_DURATION_MINUTES: u64 = 10;
pub const DEFAULT_EXTENSION_WARNING_MINUTES: u64 = 2;
pub const DEFAULT_LLM_TEMPERATURE: f32 = 0.9;
pub const DEFAULT_LLM_MAX_TOKENS: u32 = 300;
pub const DEFAULT_DECISION_MAX_TOKENS: u32 = 5;
pub const DEFAULT_HISTORY_WINDOW: usize = 20;
pub const DEFAULT_COMPLETION_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ENDED_SESSION_RETENTION_SECS: u64 = 300;

// =============================================================================
// DELAYS
// =============================================================================

/// Inclusive millisecond range for randomized pacing delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    #[must_use]
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    #[must_use]
    pub const fn zero() -> Self {
        Self { min_ms: 0, max_ms: 0 }
    }

    /// Pick a random duration inside the range. A reversed range collapses to `min_ms`.
    #[must_use]
    pub fn sample(&self) -> Duration {
        if self.max_ms <= self.min_ms {
            return Duration::from_millis(self.min_ms);
        }
        Duration::from_millis(rand::rng().random_range(self.min_ms..=self.max_ms))
    }
}

/// Human-feel pacing for the reply pipeline and lifecycle transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    /// Pause before the persona "starts typing".
    pub thinking: DelayRange,
    /// Minimum typing time while the completion is in flight.
    pub composing: DelayRange,
    /// Gap before each chat bubble after the first.
    pub between_segments: DelayRange,
    /// How long the extension outcome is shown before it is applied.
    pub extension_outcome: Duration,
    /// Wait between ending a session and provisioning its successor.
    pub rollover_settle: Duration,
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            thinking: DelayRange::new(300, 1200),
            composing: DelayRange::new(1500, 4000),
            between_segments: DelayRange::new(800, 2000),
            extension_outcome: Duration::from_millis(2000),
            rollover_settle: Duration::from_millis(3000),
        }
    }
}

impl Pacing {
    /// No artificial delays. Ordering is preserved, timing is not.
    #[must_use]
    pub fn immediate() -> Self {
        Self {
            thinking: DelayRange::zero(),
            composing: DelayRange::zero(),
            between_segments: DelayRange::zero(),
            extension_outcome: Duration::ZERO,
            rollover_settle: Duration::ZERO,
        }
    }
}

// =============================================================================
// SETTINGS
// =============================================================================

/// Text-generation parameters forwarded to the completion capability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationSettings {
    pub temperature: f32,
    pub max_tokens: u32,
    pub decision_max_tokens: u32,
    /// Number of most recent messages sent as conversation history.
    pub history_window: usize,
    pub completion_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub session_duration_secs: u64,
    pub extension_duration_secs: u64,
    /// Seconds remaining at which an extension is offered.
    pub extension_warning_secs: u64,
    pub auto_reconnect: bool,
    pub generation: GenerationSettings,
    pub pacing: Pacing,
    pub ended_retention: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            session_duration_secs: DEFAULT_SESSION_DURATION_MINUTES * 60,
            extension_duration_secs: DEFAULT_EXTENSION_DURATION_MINUTES * 60,
            extension_warning_secs: DEFAULT_EXTENSION_WARNING_MINUTES * 60,
            auto_reconnect: true,
            generation: GenerationSettings {
                temperature: DEFAULT_LLM_TEMPERATURE,
                max_tokens: DEFAULT_LLM_MAX_TOKENS,
                decision_max_tokens: DEFAULT_DECISION_MAX_TOKENS,
                history_window: DEFAULT_HISTORY_WINDOW,
                completion_timeout: Duration::from_secs(DEFAULT_COMPLETION_TIMEOUT_SECS),
            },
            pacing: Pacing::default(),
            ended_retention: Duration::from_secs(DEFAULT_ENDED_SESSION_RETENTION_SECS),
        }
    }
}

impl Settings {
    /// Build settings from the process environment.
    ///
    /// - `SESSION_DURATION_MINUTES` (10), `EXTENSION_DURATION_MINUTES` (10)
    /// - `EXTENSION_WARNING_MINUTES` (2), `AUTO_RECONNECT` (true)
    /// - `LLM_TEMPERATURE` (0.9), `LLM_MAX_TOKENS` (300), `HISTORY_WINDOW` (20)
    /// - `COMPLETION_TIMEOUT_SECS` (30), `ENDED_SESSION_RETENTION_SECS` (300)
    /// - `PACING_{THINKING,COMPOSING,SEGMENT}_{MIN,MAX}_MS`,
    ///   `PACING_EXTENSION_OUTCOME_MS`, `PACING_ROLLOVER_SETTLE_MS`
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup. Unparseable values fall
    /// back to their defaults.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse_u64 = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };
        let range = |prefix: &str, default: DelayRange| -> DelayRange {
            DelayRange::new(
                parse_u64(&format!("{prefix}_MIN_MS"), default.min_ms),
                parse_u64(&format!("{prefix}_MAX_MS"), default.max_ms),
            )
        };

        let generation = GenerationSettings {
            temperature: lookup("LLM_TEMPERATURE")
                .and_then(|v| v.trim().parse::<f32>().ok())
                .unwrap_or(defaults.generation.temperature),
            max_tokens: lookup("LLM_MAX_TOKENS")
                .and_then(|v| v.trim().parse::<u32>().ok())
                .unwrap_or(defaults.generation.max_tokens),
            decision_max_tokens: defaults.generation.decision_max_tokens,
            history_window: lookup("HISTORY_WINDOW")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(defaults.generation.history_window),
            completion_timeout: Duration::from_secs(parse_u64("COMPLETION_TIMEOUT_SECS", DEFAULT_COMPLETION_TIMEOUT_SECS)),
        };

        let pacing = Pacing {
            thinking: range("PACING_THINKING", defaults.pacing.thinking),
            composing: range("PACING_COMPOSING", defaults.pacing.composing),
            between_segments: range("PACING_SEGMENT", defaults.pacing.between_segments),
            extension_outcome: Duration::from_millis(parse_u64("PACING_EXTENSION_OUTCOME_MS", 2000)),
            rollover_settle: Duration::from_millis(parse_u64("PACING_ROLLOVER_SETTLE_MS", 3000)),
        };

        Self {
            session_duration_secs: parse_u64("SESSION_DURATION_MINUTES", DEFAULT_SESSION_DURATION_MINUTES) * 60,
            extension_duration_secs: parse_u64("EXTENSION_DURATION_MINUTES", DEFAULT_EXTENSION_DURATION_MINUTES) * 60,
            extension_warning_secs: parse_u64("EXTENSION_WARNING_MINUTES", DEFAULT_EXTENSION_WARNING_MINUTES) * 60,
            auto_reconnect: lookup("AUTO_RECONNECT")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.auto_reconnect),
            generation,
            pacing,
            ended_retention: Duration::from_secs(parse_u64(
                "ENDED_SESSION_RETENTION_SECS",
                DEFAULT_ENDED_SESSION_RETENTION_SECS,
            )),
        }
    }

    /// Session duration in whole minutes, as reported to clients.
    #[must_use]
    pub fn session_duration_minutes(&self) -> u64 {
        self.session_duration_secs / 60
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
