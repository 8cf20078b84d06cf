//! Infrastructure-backed bus implementations.
//!
//! The bus contract and the in-memory bus live in `creatiflow-events`. This
//! module provides the durable transport used in deployment.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{DEFAULT_STREAM_KEY, RedisStreamsBus, RedisStreamsError};
