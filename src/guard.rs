//! Composition root tying the engine, limiters and sweeper together.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::config::GuardConfig;
use crate::error::{Result, ThrottleError};
use crate::throttle::{FixedWindowLimiter, Sweep, Sweeper, SweeperHandle, ThrottleEngine};

/// Owns every piece of throttling state for one process.
///
/// Construct one at startup and share it behind an `Arc`. Tests build
/// their own with a manual clock, so no state leaks between them.
pub struct Guard {
    config: GuardConfig,
    engine: Arc<ThrottleEngine>,
    limiters: HashMap<String, Arc<FixedWindowLimiter>>,
    sweeper: Mutex<Option<SweeperHandle>>,
}

impl Guard {
    /// Build a guard on the system clock.
    pub fn new(config: GuardConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build a guard on the given clock.
    pub fn with_clock(config: GuardConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let engine = ThrottleEngine::new(config.policy_table()?, clock.clone())
            .with_sweep_buffer(config.sweep.buffer())
            .with_opportunistic_ratio(config.sweep.opportunistic_ratio);

        let limiters = config
            .rate_limits
            .iter()
            .map(|(name, window)| {
                let limiter = FixedWindowLimiter::new(name, *window, clock.clone())
                    .with_enabled(config.rate_limits_enabled);
                (name.clone(), Arc::new(limiter))
            })
            .collect();

        Ok(Self {
            config,
            engine: Arc::new(engine),
            limiters,
            sweeper: Mutex::new(None),
        })
    }

    /// The configuration this guard was built from.
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// The brute-force engine.
    pub fn engine(&self) -> &Arc<ThrottleEngine> {
        &self.engine
    }

    /// A fixed-window limiter by name.
    pub fn limiter(&self, name: &str) -> Result<&Arc<FixedWindowLimiter>> {
        self.limiters
            .get(name)
            .ok_or_else(|| ThrottleError::UnknownLimiter(name.to_string()))
    }

    /// Everything the sweeper should visit.
    pub fn sweep_targets(&self) -> Vec<Arc<dyn Sweep>> {
        let mut targets: Vec<Arc<dyn Sweep>> = vec![self.engine.clone() as Arc<dyn Sweep>];
        targets.extend(self.limiters.values().map(|l| l.clone() as Arc<dyn Sweep>));
        targets
    }

    /// Start periodic sweeping on the current tokio runtime.
    ///
    /// Calling this again while a sweeper is running has no effect.
    pub fn start_sweeper(&self) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_none() {
            *sweeper = Some(Sweeper::spawn(self.sweep_targets(), self.config.sweep.interval()));
        }
    }

    /// Whether the periodic sweeper is running.
    pub fn sweeper_running(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Wipe all throttling state while leaving the sweeper running.
    pub fn clear(&self) {
        self.engine.clear();
        for limiter in self.limiters.values() {
            limiter.clear();
        }
    }

    /// Stop the sweeper and wipe all state.
    pub async fn destroy(&self) {
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        self.clear();
        info!("Throttle guard destroyed");
    }
}
