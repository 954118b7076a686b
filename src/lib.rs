//! Throttle Guard - In-process brute-force defense
//!
//! This crate tracks failed attempts per client address and per logical
//! identifier, applies per-endpoint progressive delays and lockouts, and
//! sweeps stale state in the background. A simpler fixed-window limiter
//! caps raw request volume per address. All state is process-local.

pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod throttle;

pub use guard::Guard;
