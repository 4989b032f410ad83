// Configuration management module
// Loads, validates and persists the TOML settings for the context store

pub mod settings;


pub use settings::{
    BackendKind, Config, ConfigError, EmbeddingConfig, OllamaConfig, RetrievalConfig, StoreConfig,
};

/// Get the default configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}
