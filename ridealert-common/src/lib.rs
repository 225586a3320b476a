//! # RideAlert Common Library
//!
//! Shared code for the RideAlert services:
//! - Error types
//! - Bootstrap configuration (TOML + directory resolution)
//! - Location event types and broadcast scope keys

pub mod config;
pub mod error;
pub mod events;

pub use error::{Error, Result};
pub use events::{CorrectedFix, ScopeKey};
