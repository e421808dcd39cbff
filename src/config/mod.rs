//! Configuration and credential storage

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::auth::{StoredToken, TokenStore};

const ENV_URL: &str = "DAREMEX_URL";
const ENV_ANON_KEY: &str = "DAREMEX_ANON_KEY";

/// Tunables for the chat core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    /// Messages fetched per history page
    pub page_size: usize,
    /// How long a cached conversation counts as fresh
    pub cache_freshness_secs: u64,
    /// Minimum spacing between inbox refreshes triggered by realtime activity
    pub refresh_debounce_ms: u64,
    /// Storage bucket for image/video/file payloads
    pub media_bucket: String,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            page_size: 20,
            cache_freshness_secs: 300,
            refresh_debounce_ms: 500,
            media_bucket: "chat-media".to_string(),
        }
    }
}

impl ChatSettings {
    pub fn cache_freshness(&self) -> Duration {
        Duration::from_secs(self.cache_freshness_secs)
    }

    pub fn refresh_debounce(&self) -> Duration {
        Duration::from_millis(self.refresh_debounce_ms)
    }
}

/// Application configuration
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Backend project base URL (e.g. https://xyz.example.co)
    pub project_url: Option<String>,
    /// Public anonymous API key sent as `apikey` on every request
    pub anon_key: Option<String>,
    /// Session access token (JWT)
    pub access_token: Option<StoredToken>,
    /// Session refresh token
    pub refresh_token: Option<String>,
    /// Signed-in user's id (from last login)
    pub user_id: Option<String>,
    /// Signed-in user's email (from last login)
    pub email: Option<String>,
    #[serde(default)]
    pub chat: ChatSettings,
}

impl Config {
    /// Get config directory path
    fn config_dir() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "daremex", "daremex")
            .context("Could not determine config directory")?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }

    /// Get config file path
    fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from disk, applying environment overrides
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        let mut config = if path.exists() {
            let content = fs::read_to_string(&path).context("Failed to read config file")?;
            Self::parse(&content)?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var(ENV_URL) {
            config.project_url = Some(url);
        }
        if let Ok(key) = std::env::var(ENV_ANON_KEY) {
            config.anon_key = Some(key);
        }

        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to disk
    pub fn save(&self) -> Result<()> {
        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir).context("Failed to create config directory")?;

        let path = Self::config_path()?;
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&path, content).context("Failed to write config file")?;

        // Set restrictive permissions on config file (contains tokens)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&path, perms).context("Failed to set config permissions")?;
        }

        Ok(())
    }

    /// Project base URL without a trailing slash.
    pub fn project_url(&self) -> Result<String> {
        let url = self.project_url.as_deref().with_context(|| {
            format!(
                "No project URL configured. Run 'daremex configure' or set {}.",
                ENV_URL
            )
        })?;
        Ok(url.trim_end_matches('/').to_string())
    }

    pub fn anon_key(&self) -> Result<String> {
        self.anon_key.clone().with_context(|| {
            format!(
                "No anon key configured. Run 'daremex configure' or set {}.",
                ENV_ANON_KEY
            )
        })
    }

    pub fn user_id(&self) -> Result<String> {
        self.user_id
            .clone()
            .context("Not signed in. Run 'daremex login' first.")
    }
}

impl TokenStore for Config {
    fn get_access_token(&self) -> Option<StoredToken> {
        self.access_token.clone()
    }

    fn set_access_token(&mut self, token: String, expires_in: Option<u64>) {
        self.access_token = Some(StoredToken::new(token, expires_in));
    }

    fn get_refresh_token(&self) -> Option<String> {
        self.refresh_token.clone()
    }

    fn set_refresh_token(&mut self, token: String) {
        self.refresh_token = Some(token);
    }

    fn clear_tokens(&mut self) {
        self.access_token = None;
        self.refresh_token = None;
        self.user_id = None;
        self.email = None;
    }
}
