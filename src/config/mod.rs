//! # Configuration Module
//!
//! Centralized constants for block layout, key/value bounds, rebalancing
//! thresholds, and cache sizing. Interdependent values live together in
//! [`constants`] and are enforced with compile-time assertions; import from
//! here rather than redefining values locally.

pub mod constants;
pub use constants::*;
