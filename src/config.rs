//! Session configuration and the stored session file

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::{info, warn};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::UserId;

pub const DEFAULT_TYPING_COOLDOWN_MS: u64 = 1000;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_EVENT_BUFFER: usize = 100;

fn default_typing_cooldown_ms() -> u64 {
    DEFAULT_TYPING_COOLDOWN_MS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_event_buffer() -> usize {
    DEFAULT_EVENT_BUFFER
}

/// Everything needed to run a synchronization session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub base_url: String,
    pub ws_url: String,
    pub token: String,
    pub user_id: UserId,
    #[serde(default = "default_typing_cooldown_ms")]
    pub typing_cooldown_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl SyncConfig {
    pub fn new(base_url: &str, ws_url: &str, token: &str, user_id: UserId) -> Self {
        SyncConfig {
            base_url: base_url.to_string(),
            ws_url: ws_url.to_string(),
            token: token.to_string(),
            user_id,
            typing_cooldown_ms: DEFAULT_TYPING_COOLDOWN_MS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    pub fn typing_cooldown(&self) -> Duration {
        Duration::from_millis(self.typing_cooldown_ms)
    }

    /// Build a config from `NCHAT_*` environment variables, if all required ones are set
    pub fn from_env() -> Result<Option<Self>> {
        let (Ok(base_url), Ok(ws_url), Ok(token), Ok(user_id)) = (
            env::var("NCHAT_BASE_URL"),
            env::var("NCHAT_WS_URL"),
            env::var("NCHAT_TOKEN"),
            env::var("NCHAT_USER_ID"),
        ) else {
            return Ok(None);
        };

        let user_id = user_id
            .trim()
            .parse()
            .with_context(|| format!("NCHAT_USER_ID is not a user id: {}", user_id))?;
        let mut config = SyncConfig::new(&base_url, &ws_url, &token, user_id);

        if let Ok(cooldown) = env::var("NCHAT_TYPING_COOLDOWN_MS") {
            match cooldown.trim().parse() {
                Ok(ms) => config.typing_cooldown_ms = ms,
                Err(e) => warn!("Ignoring NCHAT_TYPING_COOLDOWN_MS={}: {}", cooldown, e),
            }
        }
        Ok(Some(config))
    }

    /// Environment first, then the stored session
    pub fn load(session_path: Option<&Path>) -> Result<Self> {
        if let Some(config) = Self::from_env()? {
            info!("Using configuration from environment");
            return Ok(config);
        }

        let path = match session_path {
            Some(path) => path.to_path_buf(),
            None => get_session_path()?,
        };
        match load_session_from(&path)? {
            Some(stored) => stored.into_config(),
            None => Err(anyhow!(
                "No session found at {}; log in first or set NCHAT_* variables",
                path.display()
            )),
        }
    }
}

/// Session persisted between runs. The bearer token is stored encoded.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoredSession {
    pub base_url: String,
    pub ws_url: String,
    pub user_id: UserId,
    token: String,
}

impl StoredSession {
    pub fn new(config: &SyncConfig) -> Self {
        StoredSession {
            base_url: config.base_url.clone(),
            ws_url: config.ws_url.clone(),
            user_id: config.user_id,
            token: BASE64.encode(&config.token),
        }
    }

    pub fn get_token(&self) -> Option<String> {
        BASE64
            .decode(&self.token)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    pub fn into_config(self) -> Result<SyncConfig> {
        let token = self
            .get_token()
            .ok_or_else(|| anyhow!("Stored session token is corrupt"))?;
        Ok(SyncConfig::new(&self.base_url, &self.ws_url, &token, self.user_id))
    }
}

static SESSION_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `path` instead of the default session file for the rest of the process
pub fn set_session_path_override(path: PathBuf) -> bool {
    SESSION_PATH_OVERRIDE.set(path).is_ok()
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("nchat-sync");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

pub fn get_session_path() -> Result<PathBuf> {
    if let Some(path) = SESSION_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("session.json"))
}

pub fn save_session_to(path: &Path, session: &StoredSession) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, session)?;

    info!("Session saved for user {}", session.user_id);
    Ok(())
}

pub fn load_session_from(path: &Path) -> Result<Option<StoredSession>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)?;
    let session: StoredSession = serde_json::from_str(&contents)
        .with_context(|| format!("Corrupt session file {}", path.display()))?;
    info!("Loaded session for user {} from {}", session.user_id, path.display());

    Ok(Some(session))
}

/// Forget the stored session, forcing re-authentication on the next run
pub fn clear_session_at(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
        info!("Cleared stored session at {}", path.display());
    }
    Ok(())
}

pub fn save_session(session: &StoredSession) -> Result<()> {
    save_session_to(&get_session_path()?, session)
}

pub fn load_session() -> Result<Option<StoredSession>> {
    load_session_from(&get_session_path()?)
}

pub fn clear_session() -> Result<()> {
    clear_session_at(&get_session_path()?)
}
