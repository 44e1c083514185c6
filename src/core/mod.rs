//! Core infrastructure.
//!
//! - [`config`] - Configuration parsing and validation
//! - [`error`] - Error kinds and the status classification table

pub mod config;
pub mod error;
