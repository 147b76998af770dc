//! Common utilities and shared types for noticeboard.
//!
//! This crate provides foundational components used across all noticeboard crates:
//!
//! - **Configuration**: Client settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **ID Generation**: Request correlation identifiers via [`IdGenerator`]
//!
//! # Example
//!
//! ```no_run
//! use noticeboard_common::{AppResult, Config, IdGenerator};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let id_gen = IdGenerator::new();
//!     println!("{} -> {}", id_gen.request_id(), config.api.base_url);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod id;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use id::IdGenerator;
