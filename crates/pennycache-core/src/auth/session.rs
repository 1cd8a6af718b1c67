use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// ID tokens are valid for one hour after issue.
const TOKEN_EXPIRY_MINUTES: i64 = 60;

/// Buffer time before expiry to trigger refresh (5 minutes)
const TOKEN_REFRESH_BUFFER_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    pub id_token: String,
    pub created_at: DateTime<Utc>,
}

impl SessionData {
    pub fn new(user_id: impl Into<String>, id_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            id_token: id_token.into(),
            created_at: Utc::now(),
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::minutes(TOKEN_EXPIRY_MINUTES)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at()
    }

    /// Check if the token will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        Utc::now() > self.expires_at() - Duration::minutes(TOKEN_REFRESH_BUFFER_MINUTES)
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        (self.expires_at() - Utc::now()).num_minutes().max(0)
    }
}

pub struct Session {
    cache_dir: PathBuf,
    pub data: Option<SessionData>,
}

impl Session {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            data: None,
        }
    }

    /// Load session from disk. Returns false when there is no saved
    /// session or it has expired.
    pub fn load(&mut self) -> Result<bool> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(false);
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        let data: SessionData =
            serde_json::from_str(&contents).context("Failed to parse session file")?;

        if data.is_expired() {
            debug!(user_id = %data.user_id, "Saved session has expired");
            return Ok(false);
        }
        self.data = Some(data);
        Ok(true)
    }

    /// Save session to disk
    pub fn save(&self) -> Result<()> {
        if let Some(ref data) = self.data {
            let path = self.session_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).context("Failed to create cache directory")?;
            }
            let contents = serde_json::to_string_pretty(data)?;
            std::fs::write(path, contents).context("Failed to write session file")?;
        }
        Ok(())
    }

    /// Clear session data
    pub fn clear(&mut self) -> Result<()> {
        self.data = None;
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove session file")?;
        }
        Ok(())
    }

    pub fn update(&mut self, data: SessionData) {
        self.data = Some(data);
    }

    /// Get the bearer token if a session is loaded
    pub fn token(&self) -> Option<&str> {
        self.data.as_ref().map(|d| d.id_token.as_str())
    }

    pub fn user_id(&self) -> Option<&str> {
        self.data.as_ref().map(|d| d.user_id.as_str())
    }

    /// Check if session is valid (exists and not expired)
    pub fn is_valid(&self) -> bool {
        self.data.as_ref().map(|d| !d.is_expired()).unwrap_or(false)
    }

    fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }
}
