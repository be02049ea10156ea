//! querygate - connection pooling, result caching and rate limiting for
//! database query middleware

pub mod cache;
pub mod config;
pub mod core;
pub mod limiter;
pub mod pool;
pub mod sim;

pub use crate::cache::{Fingerprint, QueryCache};
pub use crate::config::Config;
pub use crate::core::{Core, CoreError, Executor, Request, Response};
pub use crate::limiter::RateLimiter;
pub use crate::pool::{ConnectionFactory, PoolError, ResourcePool};
