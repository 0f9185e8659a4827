//! # packlink-core - Core Domain Types
//!
//! Foundation crate for packlink. Provides error handling, logging
//! initialization and the settings file types.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, thiserror, tracing, toml).
//!
//! ## Public API
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `fatal` vs `recoverable` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`ResultExt`] - Extension trait for adding error context
//!
//! ### Configuration (`config`)
//! - [`config::Settings`] - `.packlink/config.toml` contents
//! - [`config::load_settings()`] - Load settings, falling back to defaults
//!
//! ### Logging (`logging`)
//! - [`logging::init()`] - Rolling file logger filtered by `PACKLINK_LOG`
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use packlink_core::prelude::*;
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod prelude;

pub use config::{ConnectionSettings, PollingSettings, ServerSettings, Settings};
pub use error::{Error, Result, ResultExt};
