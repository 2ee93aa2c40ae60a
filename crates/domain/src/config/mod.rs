mod engine;
mod providers;
mod server;
mod storage;
mod switch;

pub use engine::*;
pub use providers::*;
pub use server::*;
pub use storage::*;
pub use switch::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub switch: SwitchConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub tts: TtsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        let mut err = |field: &str, message: String| {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: field.into(),
                message,
            });
        };

        if self.server.port == 0 {
            err("server.port", "port must be greater than 0".into());
        }
        if self.server.host.is_empty() {
            err("server.host", "host must not be empty".into());
        }
        if self.engine.max_concurrent_calls == 0 {
            err(
                "engine.max_concurrent_calls",
                "must allow at least one concurrent call".into(),
            );
        }
        if self.engine.tts_first_frame_fail_secs < self.engine.tts_first_frame_warn_secs {
            err(
                "engine.tts_first_frame_fail_secs",
                "fail threshold must not be below the warn threshold".into(),
            );
        }
        if self.engine.speech_chars_per_sec <= 0.0 {
            err(
                "engine.speech_chars_per_sec",
                "speech rate must be positive".into(),
            );
        }
        for (field, url) in [
            ("stt.base_url", &self.stt.base_url),
            ("llm.base_url", &self.llm.base_url),
            ("tts.base_url", &self.tts.base_url),
            ("switch.control_url", &self.switch.control_url),
        ] {
            if url.is_empty() {
                err(field, "must not be empty".into());
            }
        }
        if let Some(rl) = &self.server.rate_limit {
            if rl.requests_per_second == 0 || rl.burst_size == 0 {
                err(
                    "server.rate_limit",
                    "requests_per_second and burst_size must be positive".into(),
                );
            }
        }

        // Warnings.
        if self.switch.caller_id.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "switch.caller_id".into(),
                message: "no caller id configured — outbound calls will present the \
                          switch default"
                    .into(),
            });
        }
        if self.engine.barge_in_min_chars == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "engine.barge_in_min_chars".into(),
                message: "threshold of 0 barges in on any interim, including noise".into(),
            });
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_errors() {
        let cfg = Config::default();
        let issues = cfg.validate();
        assert!(
            issues
                .iter()
                .all(|i| i.severity != ConfigSeverity::Error),
            "unexpected errors: {issues:?}"
        );
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.field == "server.port"));
    }

    #[test]
    fn tts_thresholds_must_be_ordered() {
        let mut cfg = Config::default();
        cfg.engine.tts_first_frame_fail_secs = 1;
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "engine.tts_first_frame_fail_secs"));
    }

    #[test]
    fn zero_rate_limit_bounds_are_an_error() {
        let mut cfg = Config::default();
        cfg.server.rate_limit = Some(RateLimitConfig {
            requests_per_second: 0,
            burst_size: 40,
        });
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.field == "server.rate_limit"));
    }

    #[test]
    fn display_includes_severity_tag() {
        let e = ConfigError {
            severity: ConfigSeverity::Warning,
            field: "x".into(),
            message: "y".into(),
        };
        assert_eq!(e.to_string(), "[WARN] x: y");
    }
}
