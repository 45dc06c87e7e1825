// Session resolution for Parley
// Works out which tenant and endpoints to use, and persists them between runs

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use log::info;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::inbox::InboxConfig;

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    /// No tenant id from flags, environment or the session file
    #[error("No tenant id configured; pass --tenant or set PARLEY_TENANT_ID")]
    MissingTenant,

    #[error("No API URL configured; pass --api-url or set PARLEY_API_URL")]
    MissingApiUrl,

    #[error("No push URL configured; pass --push-url or set PARLEY_PUSH_URL")]
    MissingPushUrl,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Session {
    pub tenant_id: String,
    pub api_url: String,
    pub push_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>, // Base64-encoded on disk
}

impl Session {
    pub fn new(tenant_id: &str, api_url: &str, push_url: &str, token: Option<&str>) -> Self {
        Session {
            tenant_id: tenant_id.to_string(),
            api_url: api_url.to_string(),
            push_url: push_url.to_string(),
            token: token.map(|t| BASE64.encode(t)),
        }
    }

    pub fn get_token(&self) -> Option<String> {
        self.token.as_ref().and_then(|encoded| {
            BASE64
                .decode(encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
    }

    pub fn to_inbox_config(&self) -> InboxConfig {
        InboxConfig::new(&self.tenant_id, &self.api_url, &self.push_url).with_token(self.get_token())
    }
}

/// Values supplied on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct SessionOverrides {
    pub tenant_id: Option<String>,
    pub api_url: Option<String>,
    pub push_url: Option<String>,
    pub token: Option<String>,
}

/// Merge explicit overrides over a stored session.
///
/// Every field must end up non-empty except the token. There is no default
/// tenant: a missing tenant id is an error.
pub fn resolve_session(overrides: SessionOverrides, stored: Option<Session>) -> Result<Session, SessionError> {
    fn pick(explicit: Option<String>, stored: Option<String>) -> Option<String> {
        explicit
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .or_else(|| stored.filter(|v| !v.trim().is_empty()))
    }

    let stored_token = stored.as_ref().and_then(Session::get_token);
    let (stored_tenant, stored_api, stored_push) = match stored {
        Some(s) => (Some(s.tenant_id), Some(s.api_url), Some(s.push_url)),
        None => (None, None, None),
    };

    let tenant_id = pick(overrides.tenant_id, stored_tenant).ok_or(SessionError::MissingTenant)?;
    let api_url = pick(overrides.api_url, stored_api).ok_or(SessionError::MissingApiUrl)?;
    let push_url = pick(overrides.push_url, stored_push).ok_or(SessionError::MissingPushUrl)?;
    let token = pick(overrides.token, stored_token);

    Ok(Session::new(&tenant_id, &api_url, &push_url, token.as_deref()))
}

static SESSION_PATH_OVERRIDE: OnceCell<PathBuf> = OnceCell::new();

/// Use `path` instead of the per-user session file for this process
pub fn set_session_path_override(path: PathBuf) {
    if SESSION_PATH_OVERRIDE.set(path).is_err() {
        log::warn!("Session path override already set, keeping the first one");
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("parley");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

fn get_session_path() -> Result<PathBuf> {
    if let Some(path) = SESSION_PATH_OVERRIDE.get() {
        return Ok(path.clone());
    }
    Ok(get_config_dir()?.join("session.json"))
}

pub fn save_session(session: &Session) -> Result<()> {
    save_session_to(&get_session_path()?, session)
}

pub fn load_session() -> Result<Option<Session>> {
    load_session_from(&get_session_path()?)
}

pub fn save_session_to(path: &Path, session: &Session) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, session)?;

    info!("Session saved for tenant {}", session.tenant_id);
    Ok(())
}

pub fn load_session_from(path: &Path) -> Result<Option<Session>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut file = File::open(path)?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;

    let session: Session = serde_json::from_str(&contents)?;
    info!("Loaded session for tenant {} from {}", session.tenant_id, path.display());

    Ok(Some(session))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored() -> Session {
        Session::new("clinic-1", "https://api.example.com", "wss://push.example.com/ws", Some("secret"))
    }

    #[test]
    fn test_token_is_encoded_at_rest() {
        let session = stored();
        assert_ne!(session.token.as_deref(), Some("secret"));
        assert_eq!(session.get_token().as_deref(), Some("secret"));
    }

    #[test]
    fn test_overrides_win_over_stored_values() {
        let overrides = SessionOverrides {
            tenant_id: Some("clinic-2".to_string()),
            token: Some("other".to_string()),
            ..Default::default()
        };
        let session = resolve_session(overrides, Some(stored())).unwrap();
        assert_eq!(session.tenant_id, "clinic-2");
        assert_eq!(session.api_url, "https://api.example.com");
        assert_eq!(session.get_token().as_deref(), Some("other"));
    }

    #[test]
    fn test_blank_override_falls_back_to_stored() {
        let overrides = SessionOverrides {
            tenant_id: Some("  ".to_string()),
            ..Default::default()
        };
        let session = resolve_session(overrides, Some(stored())).unwrap();
        assert_eq!(session.tenant_id, "clinic-1");
        assert_eq!(session.get_token().as_deref(), Some("secret"));
    }

    #[test]
    fn test_missing_tenant_fails_loudly() {
        let overrides = SessionOverrides {
            api_url: Some("https://api".to_string()),
            push_url: Some("wss://push".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_session(overrides, None), Err(SessionError::MissingTenant));
    }

    #[test]
    fn test_missing_urls() {
        let overrides = SessionOverrides {
            tenant_id: Some("t".to_string()),
            ..Default::default()
        };
        assert_eq!(resolve_session(overrides.clone(), None), Err(SessionError::MissingApiUrl));

        let overrides = SessionOverrides {
            api_url: Some("https://api".to_string()),
            ..overrides
        };
        assert_eq!(resolve_session(overrides, None), Err(SessionError::MissingPushUrl));
    }

    #[test]
    fn test_session_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("session.json");

        assert_eq!(load_session_from(&path).unwrap(), None);
        save_session_to(&path, &stored()).unwrap();
        assert_eq!(load_session_from(&path).unwrap(), Some(stored()));
    }

    #[test]
    fn test_inbox_config_from_session() {
        let config = stored().to_inbox_config();
        assert_eq!(config.tenant_id, "clinic-1");
        assert_eq!(config.token.as_deref(), Some("secret"));
        assert_eq!(config.push_url().unwrap(), "wss://push.example.com/ws/clinic-1");
    }
}
