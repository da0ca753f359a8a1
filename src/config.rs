use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::download::DownloadStrategy;
use crate::error::{AppError, Result};
use crate::paths::LauncherPaths;

/// Version recorded when nothing has been installed yet.
pub const DEFAULT_LOCAL_VERSION: &str = "v0.0.0";
pub const DEFAULT_APP_PORT: u16 = 1998;
pub const DEFAULT_NATIVE_EXTRACT_THRESHOLD_MB: u64 = 512;

/// Persisted launcher settings (`runner-config.json`).
///
/// Keys missing from the file fall back to defaults. Keys this version does not
/// know about are kept in `extra` and written back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_local_version")]
    pub local_version: String,
    pub install_dir: PathBuf,
    /// Explicit launch command; empty means auto-detect.
    #[serde(default)]
    pub start_command: String,
    #[serde(rename = "appPort", default = "default_app_port")]
    pub listen_port: u16,
    /// Kill every process named like the runtime binary on stop. Dangerous.
    #[serde(rename = "allowNodeKill", default)]
    pub allow_force_kill_by_name: bool,
    #[serde(default)]
    pub github_proxy: String,
    #[serde(default = "default_true")]
    pub auto_update: bool,
    #[serde(default = "default_true")]
    pub managed_runtime: bool,
    #[serde(default)]
    pub download_strategy: DownloadStrategy,
    #[serde(default = "default_native_extract_threshold_mb")]
    pub native_extract_threshold_mb: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_local_version() -> String {
    DEFAULT_LOCAL_VERSION.to_string()
}

fn default_app_port() -> u16 {
    DEFAULT_APP_PORT
}

fn default_true() -> bool {
    true
}

fn default_native_extract_threshold_mb() -> u64 {
    DEFAULT_NATIVE_EXTRACT_THRESHOLD_MB
}

impl Settings {
    pub fn defaults_for(paths: &LauncherPaths) -> Self {
        Self {
            local_version: default_local_version(),
            install_dir: paths.install_dir.clone(),
            start_command: String::new(),
            listen_port: DEFAULT_APP_PORT,
            allow_force_kill_by_name: false,
            github_proxy: String::new(),
            auto_update: true,
            managed_runtime: true,
            download_strategy: DownloadStrategy::default(),
            native_extract_threshold_mb: DEFAULT_NATIVE_EXTRACT_THRESHOLD_MB,
            extra: Map::new(),
        }
    }

    /// Install directory with relative paths anchored at the launcher base.
    pub fn resolved_install_dir(&self, paths: &LauncherPaths) -> PathBuf {
        if self.install_dir.is_absolute() {
            self.install_dir.clone()
        } else {
            paths.base.join(&self.install_dir)
        }
    }

    pub fn has_start_override(&self) -> bool {
        !self.start_command.trim().is_empty()
    }

    pub fn native_extract_threshold_bytes(&self) -> u64 {
        self.native_extract_threshold_mb.saturating_mul(1024 * 1024)
    }
}

/// Loads, caches and persists [`Settings`].
///
/// Readers get a cheap `Arc` snapshot; writers go through
/// [`ConfigStore::with_settings_mut`], which serializes read-modify-write cycles.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    cache: RwLock<Arc<Settings>>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Load settings from disk, writing defaults when the file is missing or unreadable.
    pub fn load(paths: &LauncherPaths) -> Result<Self> {
        let defaults = Settings::defaults_for(paths);
        let path = paths.config_file.clone();

        let settings = if path.exists() {
            match read_merged(&path, &defaults) {
                Ok(settings) => settings,
                Err(e) => {
                    log::warn!("Config read failed ({e}), rebuilding defaults.");
                    let backup = path.with_extension("json.bak");
                    if let Err(e) = fs::rename(&path, &backup) {
                        log::warn!("Failed to keep unreadable config as {:?}: {}", backup, e);
                    }
                    write_to_disk(&path, &defaults)?;
                    defaults
                }
            }
        } else {
            write_to_disk(&path, &defaults)?;
            defaults
        };

        let settings = sanitize(settings);
        paths.validate_install_dir(&settings.resolved_install_dir(paths))?;

        Ok(Self {
            path,
            cache: RwLock::new(Arc::new(settings)),
            write_lock: Mutex::new(()),
        })
    }

    /// Current settings snapshot.
    pub fn snapshot(&self) -> Arc<Settings> {
        let settings = self.cache.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&settings)
    }

    /// Execute a read-modify-write operation on the settings file while holding a lock.
    ///
    /// The cache is only replaced once the new settings are on disk.
    pub fn with_settings_mut<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Settings) -> Result<T>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut updated = (*self.snapshot()).clone();
        let result = f(&mut updated)?;
        write_to_disk(&self.path, &updated)?;

        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(updated);

        Ok(result)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn read_merged(path: &Path, defaults: &Settings) -> Result<Settings> {
    let content = fs::read_to_string(path).map_err(|e| AppError::config(e.to_string()))?;
    let parsed: Value = serde_json::from_str(&content)?;
    let Value::Object(overrides) = parsed else {
        return Err(AppError::config("settings file is not a JSON object"));
    };

    let Value::Object(mut merged) = serde_json::to_value(defaults)? else {
        return Err(AppError::config("defaults did not serialize to an object"));
    };
    // Key by key, so one bad value only costs that key.
    for (key, value) in overrides {
        let previous = merged.insert(key.clone(), value);
        if let Err(e) = serde_json::from_value::<Settings>(Value::Object(merged.clone())) {
            log::warn!("Ignoring setting {:?}: {}", key, e);
            match previous {
                Some(previous) => merged.insert(key, previous),
                None => merged.remove(&key),
            };
        }
    }
    Ok(serde_json::from_value(Value::Object(merged))?)
}

fn sanitize(mut settings: Settings) -> Settings {
    if settings.listen_port == 0 {
        log::warn!("appPort 0 is not usable, falling back to {}", DEFAULT_APP_PORT);
        settings.listen_port = DEFAULT_APP_PORT;
    }
    settings
}

/// Write pretty JSON through a temp file and rename it over the target.
fn write_to_disk(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::config(e.to_string()))?;
    }
    let content = serde_json::to_string_pretty(settings)?;
    let temp = path.with_extension("json.tmp");
    fs::write(&temp, content).map_err(|e| AppError::config(e.to_string()))?;
    fs::rename(&temp, path).map_err(|e| AppError::config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, LauncherPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = LauncherPaths::from_base(dir.path());
        (dir, paths)
    }

    #[test]
    fn missing_file_writes_defaults() {
        let (_dir, paths) = sandbox();
        let store = ConfigStore::load(&paths).unwrap();

        let settings = store.snapshot();
        assert_eq!(settings.local_version, DEFAULT_LOCAL_VERSION);
        assert_eq!(settings.listen_port, DEFAULT_APP_PORT);
        assert_eq!(settings.install_dir, paths.install_dir);
        assert!(!settings.allow_force_kill_by_name);
        assert!(paths.config_file.exists());
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let (_dir, paths) = sandbox();
        fs::write(
            &paths.config_file,
            r#"{ "localVersion": "v1.2.0", "appPort": 4000, "theme": "dark" }"#,
        )
        .unwrap();

        let store = ConfigStore::load(&paths).unwrap();
        let settings = store.snapshot();
        assert_eq!(settings.local_version, "v1.2.0");
        assert_eq!(settings.listen_port, 4000);
        assert!(settings.start_command.is_empty());
        assert_eq!(settings.extra.get("theme"), Some(&Value::from("dark")));
    }

    #[test]
    fn unknown_keys_survive_rewrite() {
        let (_dir, paths) = sandbox();
        fs::write(&paths.config_file, r#"{ "theme": "dark" }"#).unwrap();

        let store = ConfigStore::load(&paths).unwrap();
        store
            .with_settings_mut(|settings| {
                settings.local_version = "v2.0.0".to_string();
                Ok(())
            })
            .unwrap();

        let raw: Value =
            serde_json::from_str(&fs::read_to_string(&paths.config_file).unwrap()).unwrap();
        assert_eq!(raw["localVersion"], "v2.0.0");
        assert_eq!(raw["theme"], "dark");
        assert_eq!(raw["allowNodeKill"], false);
    }

    #[test]
    fn corrupt_file_is_replaced_with_defaults() {
        let (_dir, paths) = sandbox();
        fs::write(&paths.config_file, "{ not json").unwrap();

        let store = ConfigStore::load(&paths).unwrap();
        assert_eq!(store.snapshot().local_version, DEFAULT_LOCAL_VERSION);
        assert!(paths.config_file.with_extension("json.bak").exists());
    }

    #[test]
    fn mistyped_value_only_drops_that_key() {
        let (_dir, paths) = sandbox();
        fs::write(
            &paths.config_file,
            r#"{ "localVersion": "v1.4.0", "appPort": "4000", "startCommand": "node server.js" }"#,
        )
        .unwrap();

        let store = ConfigStore::load(&paths).unwrap();
        let settings = store.snapshot();
        assert_eq!(settings.local_version, "v1.4.0");
        assert_eq!(settings.start_command, "node server.js");
        assert_eq!(settings.listen_port, DEFAULT_APP_PORT);
        assert!(!paths.config_file.with_extension("json.bak").exists());
    }

    #[test]
    fn failed_mutation_leaves_cache_untouched() {
        let (_dir, paths) = sandbox();
        let store = ConfigStore::load(&paths).unwrap();

        let result: Result<()> = store.with_settings_mut(|settings| {
            settings.local_version = "v9.9.9".to_string();
            Err(AppError::other("abort"))
        });

        assert!(result.is_err());
        assert_eq!(store.snapshot().local_version, DEFAULT_LOCAL_VERSION);
    }

    #[test]
    fn install_dir_over_tools_is_rejected() {
        let (_dir, paths) = sandbox();
        let body = serde_json::json!({ "installDir": paths.base });
        fs::write(&paths.config_file, body.to_string()).unwrap();

        assert!(ConfigStore::load(&paths).is_err());
    }
}
