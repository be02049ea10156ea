//! Backend connection pooling
//!
//! This module provides:
//! - A bounded pool of expensive backend connections
//! - Liveness checks and retirement by age or idleness
//! - Backpressure through acquire timeouts and explicit cancellation
//! - A background health sweep owned by the pool's lifecycle

pub mod connection;
pub mod factory;

pub use connection::{
    MaintenanceReport, PoolConfig, PoolError, PoolStats, PooledConnection, PooledResource,
    ResourcePool, RetireReason,
};
pub use factory::ConnectionFactory;
