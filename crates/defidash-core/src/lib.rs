//! `defidash-core`: shared plumbing for the background engine crates.
//!
//! Configuration loading, the SQLite connection opener every subsystem uses,
//! and the timestamp encoding shared by the `jobs`, `schedules` and `cache`
//! tables.

pub mod config;
pub mod db;
pub mod error;
pub mod time;

pub use config::DashConfig;
pub use error::{CoreError, Result};
