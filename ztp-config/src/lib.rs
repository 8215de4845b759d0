//! Configuration for the ZTP provisioning watcher.
//!
//! Settings come from a `ztpconfig` file (YAML, TOML or JSON) with
//! `ZTP_*` environment variables layered on top. An optional `.env` file is
//! loaded first. The composed [`Config`] converts directly into the settings
//! types `ztp-core` consumes, so the binary never re-parses raw values.

pub mod loader;
pub mod models;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, error::ConfigLoadError};
pub use models::sources::{DurationValue, EnvConfig, FileConfig};
pub use models::{
    Config, ConfigFormat, ConfigMetadata, FirmwareConfig, PostConfig, SessionConfig,
    SignatureConfig, WatchConfig,
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
