//! Persisted adapter settings
//!
//! One JSON file at `${config}/banjo/settings.json` holds the state that
//! outlives a session: tool names the user chose "always allow" for, and the
//! last child session id per engine so a new session can resume it. Writes
//! are atomic (temp file + rename) and re-read on demand; there is no
//! in-process watcher.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::types::{Engine, Result};

const SETTINGS_DIR: &str = "banjo";
const SETTINGS_FILE: &str = "settings.json";

/// On-disk settings document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Tool names approved with "always allow", keyed by engine
    #[serde(default)]
    pub always_allow: HashMap<Engine, Vec<String>>,

    /// Last child session per engine, for resume on `session/new`
    #[serde(default)]
    pub last_sessions: HashMap<Engine, LastSession>,

    /// Additional settings as raw JSON (forward compatibility)
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Resume record for one engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastSession {
    /// The child's own session/thread id
    pub child_session_id: String,
    /// Working directory the session ran in
    pub cwd: PathBuf,
}

/// Loads and stores the settings file
#[derive(Debug, Clone)]
pub struct SettingsManager {
    path: PathBuf,
}

impl SettingsManager {
    /// Manager over the default settings location
    pub fn new() -> Self {
        let base = dirs::config_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            path: base.join(SETTINGS_DIR).join(SETTINGS_FILE),
        }
    }

    /// Manager over an explicit file path
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the settings file
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Read the settings file; a missing or corrupt file yields defaults
    pub fn load(&self) -> Settings {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "Corrupt settings file, using defaults");
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }

    /// Write the settings file atomically
    pub fn store(&self, settings: &Settings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(settings)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Record an always-allow choice for a tool
    pub fn add_always_allow(&self, engine: Engine, tool_name: &str) -> Result<()> {
        let mut settings = self.load();
        let entry = settings.always_allow.entry(engine).or_default();
        if !entry.iter().any(|t| t == tool_name) {
            entry.push(tool_name.to_string());
        }
        self.store(&settings)
    }

    /// The always-allow set recorded for an engine
    pub fn always_allowed(&self, engine: Engine) -> Vec<String> {
        self.load()
            .always_allow
            .get(&engine)
            .cloned()
            .unwrap_or_default()
    }

    /// Record the last child session for resume
    pub fn record_last_session(
        &self,
        engine: Engine,
        child_session_id: &str,
        cwd: &PathBuf,
    ) -> Result<()> {
        let mut settings = self.load();
        settings.last_sessions.insert(
            engine,
            LastSession {
                child_session_id: child_session_id.to_string(),
                cwd: cwd.clone(),
            },
        );
        self.store(&settings)
    }

    /// Resume token for an engine, if the recorded session ran in `cwd`
    pub fn resume_token(&self, engine: Engine, cwd: &PathBuf) -> Option<String> {
        self.load()
            .last_sessions
            .get(&engine)
            .filter(|last| &last.cwd == cwd)
            .map(|last| last.child_session_id.clone())
    }
}

impl Default for SettingsManager {
    fn default() -> Self {
        Self::new()
    }
}
