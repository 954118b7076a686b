//! Configuration management for the throttle guard.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, ThrottleError};
use crate::throttle::{EndpointPolicy, PolicyTable, WindowConfig, MAX_DURATION_SECS};

/// Prefix for environment overrides, e.g. `THROTTLE_GUARD__SWEEP__INTERVAL_SECS=60`.
pub const ENV_PREFIX: &str = "THROTTLE_GUARD";

/// Main configuration for the throttle guard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardConfig {
    /// Brute-force policies per endpoint class
    #[serde(default = "default_policies")]
    pub policies: HashMap<String, EndpointPolicy>,

    /// Fixed-window limiters by name
    #[serde(default = "default_rate_limits")]
    pub rate_limits: HashMap<String, WindowConfig>,

    /// When false, fixed-window limiters allow everything
    #[serde(default = "default_true")]
    pub rate_limits_enabled: bool,

    /// Garbage collection settings
    #[serde(default)]
    pub sweep: SweepConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            policies: default_policies(),
            rate_limits: default_rate_limits(),
            rate_limits_enabled: true,
            sweep: SweepConfig::default(),
        }
    }
}

/// Garbage collection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepConfig {
    /// Seconds between sweep passes
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,

    /// Idle slack on top of a policy's block duration, in seconds
    #[serde(default = "default_sweep_buffer")]
    pub buffer_secs: u64,

    /// Fraction of failed attempts that also trigger an inline sweep
    #[serde(default)]
    pub opportunistic_ratio: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval(),
            buffer_secs: default_sweep_buffer(),
            opportunistic_ratio: 0.0,
        }
    }
}

impl SweepConfig {
    /// Interval between sweep passes.
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Idle slack.
    pub fn buffer(&self) -> Duration {
        Duration::from_secs(self.buffer_secs)
    }
}

fn default_policies() -> HashMap<String, EndpointPolicy> {
    PolicyTable::builtin()
        .iter()
        .map(|(class, policy)| (class.to_string(), policy.clone()))
        .collect()
}

fn default_rate_limits() -> HashMap<String, WindowConfig> {
    [
        ("global", WindowConfig::new(100, 15 * 60)),
        ("auth", WindowConfig::new(30, 15 * 60)),
        ("api", WindowConfig::new(50, 5 * 60)),
        ("verification", WindowConfig::new(100, 15 * 60)),
        ("resend", WindowConfig::new(30, 5 * 60)),
        ("login", WindowConfig::new(5, 60)),
        ("passwordReset", WindowConfig::new(1, 5 * 60)),
        ("emailVerification", WindowConfig::new(1, 2 * 60)),
    ]
    .into_iter()
    .map(|(name, config)| (name.to_string(), config))
    .collect()
}

fn default_true() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_sweep_buffer() -> u64 {
    60
}

/// Scalar settings that may be overridden from the environment.
///
/// Policy and limiter tables are keyed by case-sensitive class names, so
/// they only come from the file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnvOverrides {
    rate_limits_enabled: Option<bool>,
    sweep: SweepOverrides,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SweepOverrides {
    interval_secs: Option<u64>,
    buffer_secs: Option<u64>,
    opportunistic_ratio: Option<f64>,
}

impl GuardConfig {
    /// Load configuration from a YAML file, then apply `THROTTLE_GUARD__*` environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle configuration");

        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;

        let env = config::Config::builder()
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ThrottleError::Config(format!("Failed to read environment: {}", e)))?;
        config.apply_overrides(env)?;

        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, source: config::Config) -> Result<()> {
        let overrides: EnvOverrides = source
            .try_deserialize()
            .map_err(|e| ThrottleError::Config(format!("Invalid environment override: {}", e)))?;

        if let Some(enabled) = overrides.rate_limits_enabled {
            self.rate_limits_enabled = enabled;
        }
        if let Some(secs) = overrides.sweep.interval_secs {
            self.sweep.interval_secs = secs;
        }
        if let Some(secs) = overrides.sweep.buffer_secs {
            self.sweep.buffer_secs = secs;
        }
        if let Some(ratio) = overrides.sweep.opportunistic_ratio {
            self.sweep.opportunistic_ratio = ratio;
        }
        Ok(())
    }

    fn parse(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| ThrottleError::Config(format!("Failed to parse throttle config: {}", e)))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config = Self::parse(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every policy and limiter.
    pub fn validate(&self) -> Result<()> {
        for (class, policy) in &self.policies {
            policy.validate(class)?;
        }

        for (name, limit) in &self.rate_limits {
            if limit.window_secs == 0 || limit.max_requests == 0 {
                return Err(ThrottleError::Config(format!(
                    "rate limit '{}' needs a positive window and request ceiling",
                    name
                )));
            }
            if limit.window_secs > MAX_DURATION_SECS {
                return Err(ThrottleError::Config(format!(
                    "rate limit '{}' window must not exceed {} seconds",
                    name, MAX_DURATION_SECS
                )));
            }
        }

        let ratio = self.sweep.opportunistic_ratio;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ThrottleError::Config(format!(
                "sweep.opportunistic_ratio must be within [0, 1], got {}",
                ratio
            )));
        }

        if self.sweep.interval_secs == 0 {
            return Err(ThrottleError::Config("sweep.interval_secs must be positive".to_string()));
        }
        if self.sweep.interval_secs > MAX_DURATION_SECS || self.sweep.buffer_secs > MAX_DURATION_SECS {
            return Err(ThrottleError::Config(format!(
                "sweep durations must not exceed {} seconds",
                MAX_DURATION_SECS
            )));
        }

        Ok(())
    }

    /// The policy table described by this configuration.
    pub fn policy_table(&self) -> Result<PolicyTable> {
        PolicyTable::new(self.policies.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GuardConfig::default();
        assert_eq!(config.policies.len(), 4);
        assert_eq!(config.rate_limits.len(), 8);
        assert!(config.rate_limits_enabled);
        assert_eq!(config.sweep.interval(), Duration::from_secs(300));
        assert_eq!(config.sweep.buffer(), Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = GuardConfig::from_yaml("{}").unwrap();
        assert_eq!(config, GuardConfig::default());
    }

    #[test]
    fn test_parse_custom_config() {
        let yaml = r#"
policies:
  login:
    delay_schedule: [0, 10]
    max_attempts: 3
    block_duration_secs: 120
rate_limits:
  global:
    window_secs: 60
    max_requests: 10
rate_limits_enabled: false
sweep:
  interval_secs: 30
  opportunistic_ratio: 0.1
"#;
        let config = GuardConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.policies.len(), 1);
        assert_eq!(config.policies["login"].max_attempts, 3);
        assert_eq!(config.rate_limits["global"].max_requests, 10);
        assert!(!config.rate_limits_enabled);
        assert_eq!(config.sweep.interval_secs, 30);
        assert_eq!(config.sweep.buffer_secs, 60);
    }

    #[test]
    fn test_example_config_parses() {
        let config = GuardConfig::from_yaml(include_str!("../throttle-guard.example.yaml")).unwrap();
        let table = config.policy_table().unwrap();

        assert_eq!(table.len(), 4);
        assert_eq!(table.get("login").unwrap().max_attempts, 7);
        assert_eq!(config.rate_limits.len(), 2);
    }

    #[test]
    fn test_invalid_ratio_rejected() {
        let yaml = r#"
sweep:
  opportunistic_ratio: 1.5
"#;
        let err = GuardConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ThrottleError::Config(_)));
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let yaml = r#"
policies:
  login:
    max_attempts: 0
    block_duration_secs: 60
"#;
        let err = GuardConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, ThrottleError::InvalidPolicy { .. }));
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let block = r#"
policies:
  login:
    max_attempts: 3
    block_duration_secs: 10000000000000
"#;
        let err = GuardConfig::from_yaml(block).unwrap_err();
        assert!(matches!(err, ThrottleError::InvalidPolicy { .. }));

        let window = r#"
rate_limits:
  global:
    window_secs: 10000000000000
    max_requests: 10
"#;
        let err = GuardConfig::from_yaml(window).unwrap_err();
        assert!(matches!(err, ThrottleError::Config(_)));

        let buffer = r#"
sweep:
  buffer_secs: 18446744073709551615
"#;
        let err = GuardConfig::from_yaml(buffer).unwrap_err();
        assert!(matches!(err, ThrottleError::Config(_)));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("throttle-guard-{}.yaml", std::process::id()));
        std::fs::write(
            &path,
            "policies:\n  login:\n    max_attempts: 4\n    block_duration_secs: 60\n",
        )
        .unwrap();

        let config = GuardConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.policies["login"].max_attempts, 4);
        assert_eq!(config.rate_limits.len(), 8);
    }

    #[test]
    fn test_overrides_apply_to_scalars() {
        let mut config = GuardConfig::default();
        let source = config::Config::builder()
            .set_override("sweep.interval_secs", 45)
            .unwrap()
            .set_override("rate_limits_enabled", false)
            .unwrap()
            .build()
            .unwrap();

        config.apply_overrides(source).unwrap();
        assert_eq!(config.sweep.interval_secs, 45);
        assert_eq!(config.sweep.buffer_secs, 60);
        assert!(!config.rate_limits_enabled);
    }

    #[test]
    fn test_load_missing_file() {
        let err = GuardConfig::load("/nonexistent/throttle.yaml").unwrap_err();
        assert!(matches!(err, ThrottleError::Io(_)));
    }
}
