//! PAL Common Library
//!
//! This crate provides shared constants and configuration loading utilities
//! for the PAL shared memory workspace.
//!
//! # Module Structure
//!
//! - [`consts`] - Segment geometry and path limits
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! pal = { package = "pal_common", path = "../pal_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use pal_common::consts::*;
//! use pal_common::config::{ConfigLoader, LogLevel};
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
