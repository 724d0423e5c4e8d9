//! Common utilities and shared types for huddle.
//!
//! This crate provides the foundational pieces used across the huddle crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//!
//! # Example
//!
//! ```no_run
//! use huddle_common::{AppResult, Config};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     println!("Redis at {}", config.redis.url);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;

pub use config::{Config, QueueConfig, RedisConfig, RetrySettings, ServerConfig, ServiceConfig};
pub use error::{AppError, AppResult};
