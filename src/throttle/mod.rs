//! Brute-force throttling logic and state management.

mod client;
mod engine;
mod policy;
mod store;
mod sweeper;
mod window;

pub use client::{client_address, normalize_identifier, UNKNOWN_ADDRESS};
pub use engine::{DenyReason, ThrottleDecision, ThrottleEngine, DEFAULT_SWEEP_BUFFER};
pub use policy::{EndpointPolicy, PolicyTable, MAX_DURATION_SECS};
pub use store::{AttemptKey, AttemptRecord, AttemptStore, Dimension};
pub use sweeper::{sweep_all, Sweep, Sweeper, SweeperHandle};
pub use window::{FixedWindowLimiter, RateLimitRecord, WindowConfig, WindowDecision};
