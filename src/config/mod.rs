//! Configuration loading.
//!
//! - [`types`]: `Config`, `DnsConfig`, `JailConfig` and duration settings
//! - [`defaults`]: serde default functions

mod defaults;
mod types;

pub use crate::error::ConfigError;
pub use types::{Config, DnsConfig, DurationSetting, JailConfig};
