//! Infrastructure layer: broker backends and their configuration.

pub mod config;

#[cfg(feature = "redis")]
pub mod broker;

pub use config::RedisStreamsConfig;

#[cfg(feature = "redis")]
pub use broker::{RedisStreamsBackend, RedisStreamsError};
