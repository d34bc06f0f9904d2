//! Shared configuration and logging bootstrap for the roomcast crates.

pub mod config;
pub mod logging;

pub use config::{
    Config, HlsConfig, LoggingConfig, QualityConfig, QualityTier, TranscoderConfig,
};
