//! Resource Pool Module
//!
//! Bounded pooling for expensive, reusable resources with RAII release,
//! memory-gated lazy construction, and error-driven self-healing.

mod resource;

pub use resource::{PoolConfig, PoolGuard, PoolHealth, ResourcePool, SlotHealth};
