//! Display preference stores
//!
//! Preferences are kept per cluster context. The TOML store persists them
//! to `~/.kubepanel/preferences.toml`; a missing or unreadable file simply
//! yields defaults.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::warn;

use kubepanel_types::{DisplayPreferences, PreferencesError, PreferencesStore};

const PREFERENCES_FILE: &str = "preferences.toml";

/// Process-local preference store
#[derive(Default)]
pub struct MemoryPreferencesStore {
    prefs: RwLock<HashMap<String, DisplayPreferences>>,
}

impl MemoryPreferencesStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with preferences for one context
    pub fn with_context(context: impl Into<String>, prefs: DisplayPreferences) -> Self {
        let store = Self::new();
        store.prefs.write().insert(context.into(), prefs);
        store
    }
}

impl PreferencesStore for MemoryPreferencesStore {
    fn load(&self, context: &str) -> DisplayPreferences {
        self.prefs.read().get(context).cloned().unwrap_or_default()
    }

    fn save(&self, context: &str, prefs: &DisplayPreferences) -> Result<(), PreferencesError> {
        self.prefs
            .write()
            .insert(context.to_string(), prefs.clone());
        Ok(())
    }
}

/// On-disk layout: one table per cluster context
#[derive(Debug, Default, Serialize, Deserialize)]
struct PreferencesFile {
    #[serde(default)]
    contexts: BTreeMap<String, DisplayPreferences>,
}

/// Preference store persisted as TOML
pub struct TomlPreferencesStore {
    path: PathBuf,
    file: RwLock<PreferencesFile>,
}

impl TomlPreferencesStore {
    /// Default location under the user's home directory
    pub fn default_path() -> Option<PathBuf> {
        let home = dirs::home_dir()?;
        Some(home.join(".kubepanel").join(PREFERENCES_FILE))
    }

    /// Load the store from `path`
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let file = match fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring unreadable preferences file");
                PreferencesFile::default()
            }),
            Err(_) => PreferencesFile::default(),
        };

        Self {
            path,
            file: RwLock::new(file),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PreferencesStore for TomlPreferencesStore {
    fn load(&self, context: &str) -> DisplayPreferences {
        self.file
            .read()
            .contexts
            .get(context)
            .cloned()
            .unwrap_or_default()
    }

    fn save(&self, context: &str, prefs: &DisplayPreferences) -> Result<(), PreferencesError> {
        let content = {
            let mut file = self.file.write();
            file.contexts.insert(context.to_string(), prefs.clone());
            toml::to_string_pretty(&*file).map_err(|e| PreferencesError::Encode(e.to_string()))?
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, content)?;
        Ok(())
    }
}
