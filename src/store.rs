//! Persistence Store
//!
//! Two-tier key-value storage backing the session: a durable tier (task and
//! knowledge-graph selection, optional share token) and a session tier (last
//! input per task, last output snapshot) that is cleared on clean exit.
//! Storage failures and corrupt JSON are never fatal; the affected keys are
//! treated as absent.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::protocol::Task;
use crate::share::OutputSnapshot;

/// Durable tier file. Survives any restart.
const SETTINGS_FILE: &str = "settings.json";
/// Session tier file. Removed on clean exit, restored after a crash.
const SESSION_FILE: &str = "session-state.json";

/// Application data directory name under the platform data dir.
const APP_DIR: &str = "grasp-client";

/// Durable settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub task: Option<Task>,
    pub selected_kgs: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub share_token: Option<String>,
}

/// Session-scoped state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionState {
    /// Most recent literal input per task, used to repopulate the composer.
    pub last_input: BTreeMap<String, String>,
    pub last_output: Option<OutputSnapshot>,
    /// When the conversation was last persisted.
    pub saved_at: Option<DateTime<Utc>>,
}

/// File-backed store. A store without a usable root silently drops writes
/// and reads everything as absent.
#[derive(Debug, Clone)]
pub struct Store {
    root: Option<PathBuf>,
}

impl Store {
    /// Open the store under the platform data directory.
    pub fn open_default() -> Self {
        let Some(base) = dirs::data_dir() else {
            warn!("No platform data directory, persistence disabled");
            return Store { root: None };
        };
        Store::at_root(base.join(APP_DIR))
    }

    /// Open the store under an explicit root.
    pub fn at_root(root: PathBuf) -> Self {
        if let Err(e) = fs::create_dir_all(&root) {
            warn!(path = ?root, error = %e, "Cannot create data directory, persistence disabled");
            return Store { root: None };
        }
        Store { root: Some(root) }
    }

    /// Store without any backing storage.
    pub fn disabled() -> Self {
        Store { root: None }
    }

    // ---- durable tier ----

    pub fn settings(&self) -> Settings {
        self.read_json(SETTINGS_FILE)
    }

    pub fn set_task(&self, task: Task) {
        let mut settings = self.settings();
        settings.task = Some(task);
        self.write_json(SETTINGS_FILE, &settings);
    }

    pub fn set_selected_kgs(&self, kgs: &[String]) {
        let mut settings = self.settings();
        settings.selected_kgs = Some(kgs.to_vec());
        self.write_json(SETTINGS_FILE, &settings);
    }

    pub fn share_token(&self) -> Option<String> {
        self.settings().share_token
    }

    pub fn set_share_token(&self, token: Option<String>) {
        let mut settings = self.settings();
        settings.share_token = token;
        self.write_json(SETTINGS_FILE, &settings);
    }

    // ---- session tier ----

    pub fn session_state(&self) -> SessionState {
        self.read_json(SESSION_FILE)
    }

    pub fn last_input(&self, task: Task) -> Option<String> {
        self.session_state().last_input.get(task.id()).cloned()
    }

    pub fn set_last_input(&self, task: Task, input: &str) {
        let mut state = self.session_state();
        state.last_input.insert(task.id().to_string(), input.to_string());
        self.write_json(SESSION_FILE, &state);
    }

    pub fn set_last_output(&self, snapshot: &OutputSnapshot) {
        let mut state = self.session_state();
        state.last_output = Some(snapshot.clone());
        state.saved_at = Some(Utc::now());
        self.write_json(SESSION_FILE, &state);
    }

    pub fn replace_session_state(&self, state: &SessionState) {
        self.write_json(SESSION_FILE, state);
    }

    /// Remove the session tier entirely.
    pub fn clear_session_state(&self) {
        self.remove(SESSION_FILE);
    }

    // ---- plumbing ----

    fn read_json<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        let Some(root) = &self.root else {
            return T::default();
        };
        let path = root.join(name);
        if !path.exists() {
            return T::default();
        }
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to read stored state");
                return T::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                warn!(path = ?path, error = %e, "Corrupt stored state, treating as absent");
                T::default()
            }
        }
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) {
        let Some(root) = &self.root else {
            return;
        };
        let path = root.join(name);
        let content = match serde_json::to_string_pretty(value) {
            Ok(content) => content,
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to serialize state");
                return;
            }
        };
        if let Err(e) = atomic_write(&path, &content) {
            warn!(path = ?path, error = %e, "Failed to persist state");
        }
    }

    fn remove(&self, name: &str) {
        let Some(root) = &self.root else {
            return;
        };
        let path = root.join(name);
        if path.exists() {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = ?path, error = %e, "Failed to remove stored state");
            }
        }
    }
}

/// Atomic write: write to a .tmp sibling then rename into place.
/// Prevents corruption if the process crashes mid-write.
fn atomic_write(path: &Path, contents: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
