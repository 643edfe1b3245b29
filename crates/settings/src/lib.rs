//! ShareCraft Settings
//!
//! Explicit configuration for the pipeline, the census client and the
//! settlement client. Values are read once and passed into each component
//! at construction; nothing is read from the process environment later.
//!
//! ## Usage
//!
//! ```no_run
//! use sharecraft_settings::Settings;
//!
//! let mut settings = Settings::load_or_default()?;
//! settings.pipeline.batch_size = 50;
//! settings.validate()?;
//! settings.save()?;
//! # Ok::<(), sharecraft_settings::SettingsError>(())
//! ```

mod config;

pub use config::{CensusSettings, LedgerMode, LedgerSettings, PipelineSettings, Settings};

use std::path::PathBuf;

use sharecraft_keystore::default_config_dir;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write settings: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse settings: {0}")]
    ParseError(serde_json::Error),

    #[error("Failed to create config directory: {0}")]
    CreateDirError(std::io::Error),

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

/// Get the default settings file path
pub fn default_settings_path() -> PathBuf {
    default_config_dir().join("settings.json")
}
