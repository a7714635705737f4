//! Pouchmail Core Library
//!
//! Gmail sync and local cache core for the Pouchmail client: single-flight
//! credential refresh, TTL-bounded record caching, attachment extraction and
//! binary transfers.

pub mod attachments;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod sync;
pub mod transfer;

pub use config::Config;
pub use error::{Error, Result};

/// Application name for config and data paths
pub const APP_NAME: &str = "pouchmail";
