//! Application configuration management.
//!
//! This module handles loading and saving the application configuration:
//! backend and auth provider endpoints, where the access token is kept, and
//! the last email used to sign in.
//!
//! Configuration is stored at `~/.config/bitdrop/config.json`. The
//! environment variables `API_BASE`, `SUPABASE_URL`, `SUPABASE_ANON_KEY` and
//! `BITDROP_TOKEN_STORE` override the file.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::auth::{FileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenStore};

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "bitdrop";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Default backend base URL
const DEFAULT_API_BASE: &str = "http://localhost:8080/api";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Where the access token is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenStoreKind {
    #[default]
    Keyring,
    File,
    Memory,
}

impl std::str::FromStr for TokenStoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "keyring" => Ok(TokenStoreKind::Keyring),
            "file" => Ok(TokenStoreKind::File),
            "memory" => Ok(TokenStoreKind::Memory),
            other => bail!("Unknown token store '{}': expected keyring, file or memory", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base: String,
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub token_store: TokenStoreKind,
    pub request_timeout_secs: u64,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            token_store: TokenStoreKind::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            last_email: None,
        }
    }
}

impl Config {
    /// Load from disk, then apply environment overrides
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Apply overrides from a variable lookup (normally the process environment)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = non_empty("API_BASE") {
            self.api_base = value;
        }
        if let Some(value) = non_empty("SUPABASE_URL") {
            self.supabase_url = value;
        }
        if let Some(value) = non_empty("SUPABASE_ANON_KEY") {
            self.supabase_anon_key = value;
        }
        if let Some(value) = non_empty("BITDROP_TOKEN_STORE") {
            self.token_store = value.parse()?;
        }
        Ok(())
    }

    /// Reject configurations that cannot reach the backend or auth provider
    pub fn validate(&self) -> Result<()> {
        if self.api_base.trim().is_empty() {
            bail!("API base URL is not configured (set API_BASE)");
        }
        if self.supabase_url.trim().is_empty() {
            bail!("Auth provider URL is not configured (set SUPABASE_URL)");
        }
        if self.supabase_anon_key.trim().is_empty() {
            bail!("Auth provider key is not configured (set SUPABASE_ANON_KEY)");
        }
        if self.request_timeout_secs == 0 {
            bail!("Request timeout must be at least one second");
        }
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Build the configured token store
    pub fn token_store(&self) -> Result<Arc<dyn TokenStore>> {
        Ok(match self.token_store {
            TokenStoreKind::Keyring => Arc::new(KeyringTokenStore::default()),
            TokenStoreKind::File => Arc::new(FileTokenStore::new(self.data_dir()?)),
            TokenStoreKind::Memory => Arc::new(MemoryTokenStore::new()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.token_store, TokenStoreKind::Keyring);
        assert_eq!(config.request_timeout_secs, DEFAULT_REQUEST_TIMEOUT_SECS);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_apply_non_empty_values() {
        let mut config = Config::default();
        config
            .apply_overrides(lookup(&[
                ("API_BASE", "https://api.bitdrop.app/api"),
                ("SUPABASE_URL", "https://xyz.supabase.co"),
                ("SUPABASE_ANON_KEY", "anon"),
                ("BITDROP_TOKEN_STORE", "File"),
            ]))
            .unwrap();

        assert_eq!(config.api_base, "https://api.bitdrop.app/api");
        assert_eq!(config.supabase_url, "https://xyz.supabase.co");
        assert_eq!(config.token_store, TokenStoreKind::File);
        assert!(config.validate().is_ok());

        config.apply_overrides(lookup(&[("API_BASE", "  ")])).unwrap();
        assert_eq!(config.api_base, "https://api.bitdrop.app/api");
    }

    #[test]
    fn test_unknown_token_store_is_rejected() {
        let mut config = Config::default();
        assert!(config
            .apply_overrides(lookup(&[("BITDROP_TOKEN_STORE", "floppy")]))
            .is_err());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = serde_json::from_str(r#"{"last_email":"a@b.com"}"#).unwrap();
        assert_eq!(config.last_email.as_deref(), Some("a@b.com"));
        assert_eq!(config.api_base, DEFAULT_API_BASE);
        assert_eq!(config.token_store, TokenStoreKind::Keyring);
    }
}
