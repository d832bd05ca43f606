//! Production broker backends.

pub mod redis_streams;

pub use redis_streams::{RedisStreamsBackend, RedisStreamsError};
