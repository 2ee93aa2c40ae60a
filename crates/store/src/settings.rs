//! Runtime settings: a persisted string key/value store overlaying the
//! static config.
//!
//! Readers take an immutable `Arc` snapshot without locking contention;
//! `set` and `reload` atomically swap the snapshot. Recognized keys
//! include provider API keys (`stt.api_key`, `llm.api_key`,
//! `tts.api_key`), `max_concurrent_calls`, and model/voice defaults.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use vox_domain::error::{Error, Result};

pub struct SettingsStore {
    path: PathBuf,
    snapshot: RwLock<Arc<HashMap<String, String>>>,
}

impl SettingsStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path).map_err(Error::Io)?;
        let path = state_path.join("settings.json");
        let map = Self::read_file(&path);
        Ok(Self {
            path,
            snapshot: RwLock::new(Arc::new(map)),
        })
    }

    fn read_file(path: &Path) -> HashMap<String, String> {
        if let Ok(raw) = std::fs::read_to_string(path) {
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        }
    }

    /// The live view. Cheap to clone; stable for the holder's lifetime.
    pub fn snapshot(&self) -> Arc<HashMap<String, String>> {
        self.snapshot.read().clone()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.snapshot.read().get(key).cloned()
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut next = (**self.snapshot.read()).clone();
        next.insert(key.to_string(), value.to_string());
        let json = serde_json::to_string_pretty(&next)?;
        std::fs::write(&self.path, json).map_err(Error::Io)?;
        *self.snapshot.write() = Arc::new(next);
        Ok(())
    }

    pub fn set_many(&self, values: HashMap<String, String>) -> Result<()> {
        let mut next = (**self.snapshot.read()).clone();
        next.extend(values);
        let json = serde_json::to_string_pretty(&next)?;
        std::fs::write(&self.path, json).map_err(Error::Io)?;
        *self.snapshot.write() = Arc::new(next);
        Ok(())
    }

    /// Re-read the backing file and swap the live view, picking up edits
    /// made outside this process. No restart required.
    pub fn reload(&self) -> usize {
        let map = Self::read_file(&self.path);
        let len = map.len();
        *self.snapshot.write() = Arc::new(map);
        len
    }

    // ── Typed accessors for recognized keys ──────────────────────────

    pub fn max_concurrent_calls(&self) -> Option<usize> {
        self.get("max_concurrent_calls")
            .and_then(|v| v.parse().ok())
    }

    /// Provider API key: settings overlay first, then the config-named
    /// environment variable.
    pub fn api_key(&self, setting_key: &str, env_var: &str) -> String {
        self.get(setting_key)
            .or_else(|| std::env::var(env_var).ok())
            .unwrap_or_default()
    }
}
