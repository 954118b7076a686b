//! Progressive-delay and lockout engine.
//!
//! A request is evaluated against the address record and, when the caller
//! knows it, the identifier record for the same endpoint class. The more
//! restrictive of the two wins, so rotating addresses against one account
//! (or accounts from one address) does not reset the count.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::policy::{EndpointPolicy, PolicyTable};
use super::store::{AttemptKey, AttemptRecord, AttemptStore};
use super::sweeper::Sweep;
use crate::clock::{add_saturating, to_delta, to_duration, Clock};
use crate::error::Result;

/// Default slack added to a policy's block duration before an idle record is swept.
pub const DEFAULT_SWEEP_BUFFER: Duration = Duration::from_secs(60);

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// A lockout is in force
    Locked,
    /// The progressive delay has not elapsed yet
    Throttled,
}

/// Outcome of [`ThrottleEngine::check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThrottleDecision {
    /// Whether the caller may proceed
    pub allowed: bool,
    /// How long to wait before trying again (zero when allowed)
    pub retry_after: Duration,
    /// Failures left before a lockout
    pub remaining_attempts: u32,
    /// End of the lockout, when locked
    pub blocked_until: Option<DateTime<Utc>>,
    /// Set when denied
    pub reason: Option<DenyReason>,
}

impl ThrottleDecision {
    fn allow(remaining_attempts: u32) -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
            remaining_attempts,
            blocked_until: None,
            reason: None,
        }
    }

    fn locked(retry_after: Duration, blocked_until: DateTime<Utc>) -> Self {
        Self {
            allowed: false,
            retry_after,
            remaining_attempts: 0,
            blocked_until: Some(blocked_until),
            reason: Some(DenyReason::Locked),
        }
    }

    fn throttled(retry_after: Duration, remaining_attempts: u32) -> Self {
        Self {
            allowed: false,
            retry_after,
            remaining_attempts,
            blocked_until: None,
            reason: Some(DenyReason::Throttled),
        }
    }

    /// Retry hint rounded up to whole seconds, suitable for a `Retry-After` value.
    pub fn retry_after_secs(&self) -> u64 {
        ceil_secs(self.retry_after)
    }
}

pub(crate) fn ceil_secs(d: Duration) -> u64 {
    if d.subsec_nanos() > 0 {
        d.as_secs() + 1
    } else {
        d.as_secs()
    }
}

/// Brute-force defense engine shared by every call site.
///
/// The single-window variant is the same engine driven by a policy with an
/// empty delay schedule and a `window_secs`.
pub struct ThrottleEngine {
    policies: PolicyTable,
    store: AttemptStore,
    clock: Arc<dyn Clock>,
    sweep_buffer: Duration,
    opportunistic_ratio: f64,
}

impl ThrottleEngine {
    /// Create an engine over the given policies and clock.
    pub fn new(policies: PolicyTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            policies,
            store: AttemptStore::new(),
            clock,
            sweep_buffer: DEFAULT_SWEEP_BUFFER,
            opportunistic_ratio: 0.0,
        }
    }

    /// Override the idle slack used by [`ThrottleEngine::sweep`].
    pub fn with_sweep_buffer(mut self, buffer: Duration) -> Self {
        self.sweep_buffer = buffer;
        self
    }

    /// Sweep inline on this fraction of failed attempts (0 disables).
    pub fn with_opportunistic_ratio(mut self, ratio: f64) -> Self {
        self.opportunistic_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    /// The policy table.
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// The underlying record store.
    pub fn store(&self) -> &AttemptStore {
        &self.store
    }

    /// Decide whether a request may proceed.
    ///
    /// Reaching `max_attempts` here starts the lockout on every existing
    /// record of the pair.
    pub fn check(
        &self,
        class: &str,
        address: &str,
        identifier: Option<&str>,
    ) -> Result<ThrottleDecision> {
        let policy = self.policies.get(class)?;
        let now = self.clock.now();
        let keys = AttemptKey::pair(class, address, identifier);

        let mut records = self.store.lock();
        expire_records(&mut records, &keys, policy, now);

        let active_block = keys
            .iter()
            .filter_map(|k| records.get(k))
            .filter_map(|r| r.blocked_until)
            .filter(|until| *until > now)
            .max();

        if let Some(until) = active_block {
            trace!(class, address, ?identifier, %until, "Request denied, lockout in force");
            return Ok(ThrottleDecision::locked(to_duration(until - now), until));
        }

        let max_count = keys
            .iter()
            .filter_map(|k| records.get(k))
            .map(|r| r.count)
            .max()
            .unwrap_or(0);

        if max_count >= policy.max_attempts {
            let until = add_saturating(now, policy.block_duration());
            for key in &keys {
                if let Some(record) = records.get_mut(key) {
                    record.blocked_until = Some(until);
                }
            }
            warn!(
                class,
                address,
                ?identifier,
                failures = max_count,
                %until,
                "Too many failed attempts, locking out"
            );
            return Ok(ThrottleDecision::locked(policy.block_duration(), until));
        }

        let remaining = policy.max_attempts - max_count;
        let required = policy.required_delay(max_count);
        let last_attempt = keys
            .iter()
            .filter_map(|k| records.get(k))
            .map(|r| r.last_attempt_at)
            .max();

        if let Some(last) = last_attempt {
            // Skewed clocks can put `last` in the future; treat that as no time elapsed.
            let elapsed = to_duration(now - last);
            if elapsed < required {
                let wait = required - elapsed;
                trace!(class, address, ?identifier, ?wait, "Request throttled");
                return Ok(ThrottleDecision::throttled(wait, remaining));
            }
        }

        trace!(class, address, ?identifier, remaining, "Request allowed");
        Ok(ThrottleDecision::allow(remaining))
    }

    /// Report the outcome of a downstream operation.
    ///
    /// A success forgives all history for the pair in this class.
    pub fn record_attempt(
        &self,
        class: &str,
        address: &str,
        identifier: Option<&str>,
        success: bool,
    ) -> Result<()> {
        if success {
            return self.clear_attempts(class, address, identifier);
        }

        let policy = self.policies.get(class)?;
        let now = self.clock.now();
        let keys = AttemptKey::pair(class, address, identifier);

        {
            let mut records = self.store.lock();
            expire_records(&mut records, &keys, policy, now);

            for key in keys {
                let record = records
                    .entry(key)
                    .and_modify(|r| r.register_failure(now))
                    .or_insert_with(|| AttemptRecord::first_failure(now));
                debug!(class, count = record.count, "Recorded failed attempt");
            }
        }

        self.maybe_sweep();
        Ok(())
    }

    /// Failures left before a lockout, taking the stricter of both dimensions.
    pub fn remaining_attempts(
        &self,
        class: &str,
        address: &str,
        identifier: Option<&str>,
    ) -> Result<u32> {
        let policy = self.policies.get(class)?;
        let now = self.clock.now();
        let keys = AttemptKey::pair(class, address, identifier);

        let mut records = self.store.lock();
        expire_records(&mut records, &keys, policy, now);

        let remaining = keys
            .iter()
            .filter_map(|k| records.get(k))
            .map(|r| {
                if r.is_blocked(now) {
                    0
                } else {
                    policy.max_attempts.saturating_sub(r.count)
                }
            })
            .min()
            .unwrap_or(policy.max_attempts);
        Ok(remaining)
    }

    /// Forget the pair's history in one class.
    pub fn clear_attempts(&self, class: &str, address: &str, identifier: Option<&str>) -> Result<()> {
        self.policies.get(class)?;
        let keys = AttemptKey::pair(class, address, identifier);

        let mut records = self.store.lock();
        for key in &keys {
            if records.remove(key).is_some() {
                debug!(key = %key, "Cleared attempt history");
            }
        }
        Ok(())
    }

    /// Snapshot of a single record.
    pub fn record(&self, key: &AttemptKey) -> Option<AttemptRecord> {
        self.store.get(key)
    }

    /// Drop every idle record that is not locked out.
    ///
    /// A record is idle once its last failure is older than the class's
    /// block duration plus the sweep buffer. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let buffer = to_delta(self.sweep_buffer);

        let removed = self.store.retain(|key, record| {
            if record.is_blocked(now) {
                return true;
            }
            match self.policies.get(&key.class) {
                Ok(policy) => match to_delta(policy.block_duration()).checked_add(&buffer) {
                    Some(limit) => now - record.last_attempt_at <= limit,
                    None => true,
                },
                Err(_) => false,
            }
        });

        if removed > 0 {
            debug!(removed, remaining = self.store.len(), "Swept stale attempt records");
        }
        removed
    }

    /// Drop all state.
    pub fn clear(&self) {
        self.store.clear();
    }

    fn maybe_sweep(&self) {
        if self.opportunistic_ratio > 0.0 && rand::thread_rng().gen_bool(self.opportunistic_ratio) {
            self.sweep();
        }
    }
}

impl Sweep for ThrottleEngine {
    fn name(&self) -> &str {
        "throttle_engine"
    }

    fn sweep(&self) -> usize {
        ThrottleEngine::sweep(self)
    }
}

/// Reset records whose lockout ran out or whose counting window rolled over.
fn expire_records(
    records: &mut HashMap<AttemptKey, AttemptRecord>,
    keys: &[AttemptKey],
    policy: &EndpointPolicy,
    now: DateTime<Utc>,
) {
    for key in keys {
        let Some(record) = records.get(key) else {
            continue;
        };

        if record.block_expired(now) {
            debug!(key = %key, "Lockout expired, resetting record");
            records.remove(key);
            continue;
        }

        // A full window must still lock out, so only under-threshold records roll over.
        if let Some(window) = policy.window() {
            let rolled_over = record.blocked_until.is_none()
                && record.count < policy.max_attempts
                && now - record.first_attempt_at >= to_delta(window);
            if rolled_over {
                debug!(key = %key, count = record.count, "Attempt window rolled over");
                records.remove(key);
            }
        }
    }
}
