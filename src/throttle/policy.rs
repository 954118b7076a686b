//! Endpoint policies and the table that maps endpoint classes to them.
//!
//! Each endpoint class is an independent namespace with its own attempt
//! counters, progressive delay schedule and lockout duration. A policy with
//! an empty (or all-zero) delay schedule and a `window_secs` is the coarse
//! single-window variant: count failures inside a window, lock out once the
//! threshold is reached, otherwise let the window roll over.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Result, ThrottleError};

/// Longest configurable duration, roughly 100 years.
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Policy applied to every attempt within one endpoint class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPolicy {
    /// Minimum seconds since the last failure, indexed by failure count
    #[serde(default)]
    pub delay_schedule: Vec<u64>,
    /// Failures tolerated before a lockout
    pub max_attempts: u32,
    /// Lockout length in seconds
    pub block_duration_secs: u64,
    /// Counting window in seconds; records older than this roll over
    #[serde(default)]
    pub window_secs: Option<u64>,
}

impl EndpointPolicy {
    /// Create a progressive-delay policy.
    pub fn progressive(delay_schedule: Vec<u64>, max_attempts: u32, block_duration_secs: u64) -> Self {
        Self {
            delay_schedule,
            max_attempts,
            block_duration_secs,
            window_secs: None,
        }
    }

    /// Create a single-window count-then-block policy.
    pub fn single_window(max_attempts: u32, window_secs: u64, block_duration_secs: u64) -> Self {
        Self {
            delay_schedule: Vec::new(),
            max_attempts,
            block_duration_secs,
            window_secs: Some(window_secs),
        }
    }

    /// Required wait since the most recent failure once `failures` have been recorded.
    ///
    /// Counts past the end of the schedule reuse its last entry.
    pub fn required_delay(&self, failures: u32) -> Duration {
        match self.delay_schedule.last() {
            None => Duration::ZERO,
            Some(last) => {
                let secs = self
                    .delay_schedule
                    .get(failures as usize)
                    .copied()
                    .unwrap_or(*last);
                Duration::from_secs(secs)
            }
        }
    }

    /// Lockout length.
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }

    /// Counting window, if this policy rolls over.
    pub fn window(&self) -> Option<Duration> {
        self.window_secs.map(Duration::from_secs)
    }

    /// Check that this policy can be enforced.
    pub fn validate(&self, class: &str) -> Result<()> {
        let invalid = |reason: &str| ThrottleError::InvalidPolicy {
            class: class.to_string(),
            reason: reason.to_string(),
        };

        if class.is_empty() {
            return Err(invalid("endpoint class name must not be empty"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }
        if self.window_secs == Some(0) {
            return Err(invalid("window_secs must be positive when set"));
        }
        if self.block_duration_secs > MAX_DURATION_SECS
            || self.window_secs.map_or(false, |w| w > MAX_DURATION_SECS)
            || self.delay_schedule.iter().any(|d| *d > MAX_DURATION_SECS)
        {
            return Err(invalid("durations must not exceed 100 years"));
        }
        Ok(())
    }
}

/// Immutable mapping from endpoint class to policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyTable {
    policies: HashMap<String, EndpointPolicy>,
}

impl PolicyTable {
    /// Build a table, rejecting any policy that fails validation.
    pub fn new(policies: HashMap<String, EndpointPolicy>) -> Result<Self> {
        for (class, policy) in &policies {
            policy.validate(class)?;
        }
        Ok(Self { policies })
    }

    /// The classes shipped with the crate.
    pub fn builtin() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            "verification".to_string(),
            EndpointPolicy::progressive(vec![0, 0, 5, 15, 30], 5, 10 * 60),
        );
        policies.insert(
            "passwordReset".to_string(),
            EndpointPolicy::progressive(vec![0, 0, 3, 10, 30, 60], 6, 15 * 60),
        );
        policies.insert(
            "login".to_string(),
            EndpointPolicy::progressive(vec![0, 0, 5, 15, 30, 60, 120], 7, 30 * 60),
        );
        policies.insert(
            "auth".to_string(),
            EndpointPolicy::single_window(5, 15 * 60, 30 * 60),
        );
        Self { policies }
    }

    /// Look up a class; unregistered classes are a caller bug.
    pub fn get(&self, class: &str) -> Result<&EndpointPolicy> {
        self.policies
            .get(class)
            .ok_or_else(|| ThrottleError::UnknownEndpointClass(class.to_string()))
    }

    /// Whether `class` has a policy.
    pub fn contains(&self, class: &str) -> bool {
        self.policies.contains_key(class)
    }

    /// Iterate over all registered classes.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &EndpointPolicy)> {
        self.policies.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_delay_follows_schedule() {
        let policy = EndpointPolicy::progressive(vec![0, 0, 5, 15, 30, 60, 120], 7, 1800);

        assert_eq!(policy.required_delay(0), Duration::ZERO);
        assert_eq!(policy.required_delay(1), Duration::ZERO);
        assert_eq!(policy.required_delay(2), Duration::from_secs(5));
        assert_eq!(policy.required_delay(6), Duration::from_secs(120));
    }

    #[test]
    fn test_required_delay_plateaus_at_last_entry() {
        let policy = EndpointPolicy::progressive(vec![0, 2, 4], 10, 60);

        let delays: Vec<Duration> = (0..10).map(|k| policy.required_delay(k)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[9], Duration::from_secs(4));
    }

    #[test]
    fn test_empty_schedule_never_delays() {
        let policy = EndpointPolicy::single_window(5, 900, 1800);
        assert_eq!(policy.required_delay(0), Duration::ZERO);
        assert_eq!(policy.required_delay(4), Duration::ZERO);
        assert_eq!(policy.window(), Some(Duration::from_secs(900)));
    }

    #[test]
    fn test_builtin_table() {
        let table = PolicyTable::builtin();
        assert_eq!(table.len(), 4);

        let login = table.get("login").unwrap();
        assert_eq!(login.max_attempts, 7);
        assert_eq!(login.block_duration(), Duration::from_secs(30 * 60));

        let verification = table.get("verification").unwrap();
        assert_eq!(verification.max_attempts, 5);
        assert_eq!(verification.block_duration_secs, 600);
    }

    #[test]
    fn test_unknown_class_fails_fast() {
        let table = PolicyTable::builtin();
        let err = table.get("signup").unwrap_err();
        assert!(matches!(err, ThrottleError::UnknownEndpointClass(ref c) if c == "signup"));
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let mut policies = HashMap::new();
        policies.insert("login".to_string(), EndpointPolicy::progressive(vec![0], 0, 60));

        let err = PolicyTable::new(policies).unwrap_err();
        assert!(matches!(err, ThrottleError::InvalidPolicy { .. }));
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let too_long = MAX_DURATION_SECS + 1;
        let policies = [
            EndpointPolicy::progressive(vec![0], 3, too_long),
            EndpointPolicy::progressive(vec![0, too_long], 3, 60),
            EndpointPolicy::single_window(3, too_long, 60),
        ];

        for policy in policies {
            let err = policy.validate("login").unwrap_err();
            assert!(matches!(err, ThrottleError::InvalidPolicy { .. }));
        }
        assert!(EndpointPolicy::progressive(vec![0], 3, MAX_DURATION_SECS).validate("login").is_ok());
    }

    #[test]
    fn test_parse_policy_yaml() {
        let yaml = r#"
login:
  delay_schedule: [0, 1, 2]
  max_attempts: 3
  block_duration_secs: 60
auth:
  max_attempts: 5
  block_duration_secs: 1800
  window_secs: 900
"#;
        let policies: HashMap<String, EndpointPolicy> = serde_yaml::from_str(yaml).unwrap();
        let table = PolicyTable::new(policies).unwrap();

        assert_eq!(table.get("login").unwrap().delay_schedule, vec![0, 1, 2]);
        let auth = table.get("auth").unwrap();
        assert!(auth.delay_schedule.is_empty());
        assert_eq!(auth.window_secs, Some(900));
    }
}
