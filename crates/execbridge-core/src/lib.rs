//! `execbridge` Core Library
//!
//! Shared functionality for `execbridge` components:
//! - Configuration resolution and hierarchy
//! - Tracing/logging initialisation
//! - Path and environment-variable helpers
//! - HTTP client with API-key and CSRF token handling
//! - Common error types

pub mod config;
pub mod error;
pub mod http_client;
pub mod pathutil;
pub mod tracing_init;

pub use config::{Config, OutputSplit};
pub use error::{Error, Result};
