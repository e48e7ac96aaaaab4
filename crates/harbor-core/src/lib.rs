//! Harbor Core Library
//!
//! This crate provides the host configuration and top-level error type for
//! the Harbor offline proxy.

pub mod config;
pub mod error;

pub use config::ProxyConfig;
pub use error::{HostError, HostResult};
