//! In-memory attempt store.
//!
//! Address-keyed and identifier-keyed records live in one map under a
//! composite key, so both dimensions share a single lookup path and a
//! single lock.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// Tracking axis for failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    /// Client network address
    Address,
    /// Logical identifier such as a normalized email
    Identifier,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Address => write!(f, "address"),
            Dimension::Identifier => write!(f, "identifier"),
        }
    }
}

/// Key of one attempt record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttemptKey {
    /// Which axis the key belongs to
    pub dimension: Dimension,
    /// The address or identifier value
    pub key: String,
    /// Endpoint class namespace
    pub class: String,
}

impl AttemptKey {
    /// Create a new attempt key.
    pub fn new(dimension: Dimension, key: &str, class: &str) -> Self {
        Self {
            dimension,
            key: key.to_string(),
            class: class.to_string(),
        }
    }

    /// Keys for the address and, when present, the identifier of a request.
    ///
    /// Without an identifier only the address is tracked, so rotating
    /// addresses against an unnamed target is not caught here.
    pub fn pair(class: &str, address: &str, identifier: Option<&str>) -> Vec<Self> {
        let mut keys = vec![Self::new(Dimension::Address, address, class)];
        if let Some(identifier) = identifier {
            keys.push(Self::new(Dimension::Identifier, identifier, class));
        }
        keys
    }
}

impl fmt::Display for AttemptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}={}", self.class, self.dimension, self.key)
    }
}

/// Failed-attempt state for one key within one endpoint class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttemptRecord {
    /// Failures since the window began
    pub count: u32,
    /// Window start
    pub first_attempt_at: DateTime<Utc>,
    /// Most recent failure
    pub last_attempt_at: DateTime<Utc>,
    /// End of an active or expired lockout
    pub blocked_until: Option<DateTime<Utc>>,
}

impl AttemptRecord {
    /// A record holding a single failure at `now`.
    pub fn first_failure(now: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            first_attempt_at: now,
            last_attempt_at: now,
            blocked_until: None,
        }
    }

    /// Add another failure.
    pub fn register_failure(&mut self, now: DateTime<Utc>) {
        self.count = self.count.saturating_add(1);
        self.last_attempt_at = now;
    }

    /// Whether a lockout is in force at `now`.
    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        matches!(self.blocked_until, Some(until) if until > now)
    }

    /// Whether a lockout was set and has since run out.
    pub fn block_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.blocked_until, Some(until) if until <= now)
    }
}

/// Thread-safe keyed storage of attempt records.
#[derive(Debug, Default)]
pub struct AttemptStore {
    records: Mutex<HashMap<AttemptKey, AttemptRecord>>,
}

impl AttemptStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the map for a multi-record read-modify-write.
    pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<AttemptKey, AttemptRecord>> {
        self.records.lock()
    }

    /// Snapshot of one record.
    pub fn get(&self, key: &AttemptKey) -> Option<AttemptRecord> {
        self.records.lock().get(key).cloned()
    }

    /// Keep only records for which `keep` returns true; returns how many were dropped.
    pub fn retain<F>(&self, mut keep: F) -> usize
    where
        F: FnMut(&AttemptKey, &AttemptRecord) -> bool,
    {
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|k, v| keep(k, v));
        before - records.len()
    }

    /// Number of tracked records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_key_pair_without_identifier() {
        let keys = AttemptKey::pair("login", "10.0.0.1", None);
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].dimension, Dimension::Address);
    }

    #[test]
    fn test_key_pair_with_identifier() {
        let keys = AttemptKey::pair("login", "10.0.0.1", Some("a@example.com"));
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[1].dimension, Dimension::Identifier);
        assert_eq!(keys[1].to_string(), "login:identifier=a@example.com");
    }

    #[test]
    fn test_same_value_in_different_dimensions_is_distinct() {
        let a = AttemptKey::new(Dimension::Address, "x", "login");
        let b = AttemptKey::new(Dimension::Identifier, "x", "login");
        assert_ne!(a, b);
    }

    #[test]
    fn test_record_failure_and_block_state() {
        let t0 = DateTime::<Utc>::UNIX_EPOCH;
        let mut record = AttemptRecord::first_failure(t0);
        record.register_failure(t0 + TimeDelta::seconds(3));

        assert_eq!(record.count, 2);
        assert_eq!(record.first_attempt_at, t0);
        assert_eq!(record.last_attempt_at, t0 + TimeDelta::seconds(3));
        assert!(!record.is_blocked(t0));

        record.blocked_until = Some(t0 + TimeDelta::seconds(60));
        assert!(record.is_blocked(t0 + TimeDelta::seconds(59)));
        assert!(!record.is_blocked(t0 + TimeDelta::seconds(60)));
        assert!(record.block_expired(t0 + TimeDelta::seconds(60)));
    }

    #[test]
    fn test_store_retain_reports_dropped() {
        let store = AttemptStore::new();
        let t0 = DateTime::<Utc>::UNIX_EPOCH;
        {
            let mut records = store.lock();
            records.insert(AttemptKey::new(Dimension::Address, "a", "login"), AttemptRecord::first_failure(t0));
            records.insert(AttemptKey::new(Dimension::Address, "b", "login"), AttemptRecord::first_failure(t0));
        }

        let dropped = store.retain(|k, _| k.key == "a");
        assert_eq!(dropped, 1);
        assert_eq!(store.len(), 1);

        store.clear();
        assert!(store.is_empty());
    }
}
