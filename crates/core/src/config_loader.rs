use crate::config::AppConfig;
use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use std::path::Path;

const ENV_PREFIX: &str = "TRADEGATE_";

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads configuration from `config/Config.toml`, environment variables, and JSON.
    ///
    /// Missing files are skipped; every section falls back to its defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a present file cannot be parsed or a value has the wrong type.
    pub fn load() -> Result<AppConfig> {
        Self::extract(
            Self::base()
                .merge(Toml::file("config/Config.toml"))
                .merge(Env::prefixed(ENV_PREFIX).split("__"))
                .join(Json::file("config/Config.json")),
        )
    }

    /// Loads configuration with a profile overlay (`config/Config.{profile}.toml`).
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load_with_profile(profile: &str) -> Result<AppConfig> {
        Self::extract(
            Self::base()
                .merge(Toml::file("config/Config.toml"))
                .merge(Toml::file(format!("config/Config.{profile}.toml")))
                .merge(Env::prefixed(ENV_PREFIX).split("__"))
                .join(Json::file("config/Config.json")),
        )
    }

    /// Loads configuration from an explicit TOML path, then environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed.
    pub fn load_from(path: impl AsRef<Path>) -> Result<AppConfig> {
        let path = path.as_ref();
        Self::extract(
            Self::base()
                .merge(Toml::file(path))
                .merge(Env::prefixed(ENV_PREFIX).split("__")),
        )
        .with_context(|| format!("loading config from {}", path.display()))
    }

    fn base() -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
    }

    fn extract(figment: Figment) -> Result<AppConfig> {
        let config: AppConfig = figment.extract()?;
        Ok(config)
    }
}
