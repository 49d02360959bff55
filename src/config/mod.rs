//! Configuration management module.
//!
//! TOML-based layered configuration, resolved relative to the config file's
//! own location.

mod config;

pub use config::*;
