//! Optional configuration file.
//!
//! Looked up at `$FFS_CONFIG`, or `~/.config/ffs/config.json` when unset.
//! A missing file is not an error; everything has a default. The file
//! currently carries the default store address (overridden by `--store`
//! and `$FFS_STORE`) and the encoding used when printing storage keys.

use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::store::Key;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyFormat {
    #[default]
    Hex,
    Base64,
}

impl KeyFormat {
    pub fn format(self, key: &Key) -> String {
        match self {
            KeyFormat::Hex => key.to_hex(),
            KeyFormat::Base64 => key.to_base64(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Store address used when neither `--store` nor `$FFS_STORE` is set.
    pub default_store: Option<String>,
    /// Encoding for keys printed to stdout and the status surface.
    pub key_format: KeyFormat,
}

impl Config {
    /// The active config file path, honoring `$FFS_CONFIG`.
    pub fn path() -> Option<PathBuf> {
        if let Ok(path) = env::var("FFS_CONFIG") {
            return Some(PathBuf::from(path));
        }
        env::var_os("HOME").map(|home| {
            PathBuf::from(home)
                .join(".config")
                .join("ffs")
                .join("config.json")
        })
    }

    /// Loads the config file, or the defaults when there is none.
    pub fn load() -> Result<Config, ConfigError> {
        let Some(path) = Config::path() else {
            return Ok(Config::default());
        };
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Config::default()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_partial_config() {
        let config: Config =
            serde_json::from_str(r#"{"defaultStore": "file:/tmp/ffs"}"#).unwrap();
        assert_eq!(config.default_store.as_deref(), Some("file:/tmp/ffs"));
        assert_eq!(config.key_format, KeyFormat::Hex);
    }

    #[test]
    fn key_format_selects_encoding() {
        let key = Key::of(b"x");
        assert_eq!(KeyFormat::Hex.format(&key), key.to_hex());
        assert_eq!(KeyFormat::Base64.format(&key), key.to_base64());
    }
}
