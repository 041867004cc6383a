//! Persisted user preferences.
//!
//! Settings load from `settings.json`, apply an in-place migration for the
//! legacy `prioritize_by_ending_soonest` key, then apply environment
//! overrides. A dirty flag elides unnecessary writes.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::constants::SETTINGS_PATH;

/// Which algorithm ranks candidate channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriorityAlgorithm {
    #[default]
    List,
    Adaptive,
    Balanced,
    EndingSoonest,
}

/// The settings file contents. Field defaults match a fresh install.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Proxy URL (http://[user:pass@]host:port or socks5://...), empty when unset
    pub proxy: String,
    pub language: String,
    pub dark_theme: bool,
    pub autostart: bool,
    pub autostart_tray: bool,
    /// Games never mined, serialized as a sorted array
    pub exclude: BTreeSet<String>,
    /// Games mined first, in user-defined order
    pub priority: Vec<String>,
    pub priority_only: bool,
    pub priority_algorithm: PriorityAlgorithm,
    pub unlinked_campaigns: bool,
    pub connection_quality: u32,
    pub tray_notifications: bool,
    pub window_position: String,

    #[serde(skip)]
    altered: bool,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            proxy: String::new(),
            language: "English".to_string(),
            dark_theme: false,
            autostart: false,
            autostart_tray: false,
            exclude: BTreeSet::new(),
            priority: Vec::new(),
            priority_only: true,
            priority_algorithm: PriorityAlgorithm::List,
            unlinked_campaigns: false,
            connection_quality: 1,
            tray_notifications: true,
            window_position: String::new(),
            altered: false,
            path: None,
        }
    }
}

impl Settings {
    /// Load settings from the default path.
    pub fn load() -> Result<Self, SettingsError> {
        Self::load_from(SETTINGS_PATH)
    }

    /// Load settings from `path`, applying the legacy-key migration and
    /// environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let mut settings = if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|e| SettingsError(e.to_string()))?;
            let mut raw: serde_json::Value =
                serde_json::from_str(&contents).map_err(|e| SettingsError(e.to_string()))?;
            let migrated = migrate(&mut raw);
            let mut settings: Settings =
                serde_json::from_value(raw).map_err(|e| SettingsError(e.to_string()))?;
            settings.altered = migrated;
            settings
        } else {
            Settings::default()
        };
        settings.path = Some(path.to_path_buf());
        settings.apply_env();
        Ok(settings)
    }

    /// Environment overrides, applied after the file and before CLI flags.
    fn apply_env(&mut self) {
        if std::env::var("prioritize_by_ending_soonest").as_deref() == Ok("1") {
            self.priority_algorithm = PriorityAlgorithm::EndingSoonest;
        }
        if std::env::var("UNLINKED_CAMPAIGNS").as_deref() == Ok("1") {
            self.unlinked_campaigns = true;
        }
    }

    /// Mark the settings as needing a write.
    pub fn alter(&mut self) {
        self.altered = true;
    }

    pub fn is_altered(&self) -> bool {
        self.altered
    }

    /// Write the settings out if altered (or when forced). Keys are sorted
    /// on disk; `exclude` serializes as a sorted array by construction.
    pub fn save(&mut self, force: bool) -> std::io::Result<()> {
        if !self.altered && !force {
            return Ok(());
        }
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        // round-trip through a Value so keys come out sorted
        let value = serde_json::to_value(&*self).map_err(std::io::Error::other)?;
        let contents = serde_json::to_string_pretty(&value).map_err(std::io::Error::other)?;
        std::fs::write(path, contents)?;
        self.altered = false;
        Ok(())
    }

    /// Reverse index into the priority list: top of the list gets the
    /// highest value, absent games get 0.
    pub fn user_priority(&self, game_name: &str) -> usize {
        self.priority
            .iter()
            .position(|name| name == game_name)
            .map(|idx| self.priority.len() - idx)
            .unwrap_or(0)
    }
}

/// Settings failed to load; the process exits with code 4.
#[derive(Debug, thiserror::Error)]
#[error("settings load failure: {0}")]
pub struct SettingsError(pub String);

/// Migrate the legacy `prioritize_by_ending_soonest` key in place.
/// Returns true when the file contents changed.
fn migrate(raw: &mut serde_json::Value) -> bool {
    let Some(map) = raw.as_object_mut() else {
        return false;
    };
    match map.remove("prioritize_by_ending_soonest") {
        Some(legacy) => {
            if legacy.as_bool() == Some(true) {
                map.insert(
                    "priority_algorithm".to_string(),
                    serde_json::json!("ending_soonest"),
                );
            }
            true
        }
        None => false,
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(name)
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.priority_algorithm, PriorityAlgorithm::List);
        assert!(settings.priority_only);
        assert!(settings.tray_notifications);
        assert_eq!(settings.connection_quality, 1);
        assert!(!settings.is_altered());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let path = temp_path("tdm_settings_roundtrip.json");
        let mut settings = Settings::default();
        settings.path = Some(path.clone());
        settings.priority = vec!["GameA".to_string(), "GameB".to_string()];
        settings.exclude.insert("Boring".to_string());
        settings.priority_algorithm = PriorityAlgorithm::Balanced;
        settings.save(true).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.priority, settings.priority);
        assert_eq!(loaded.exclude, settings.exclude);
        assert_eq!(loaded.priority_algorithm, PriorityAlgorithm::Balanced);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_exclude_serializes_sorted() {
        let mut settings = Settings::default();
        settings.exclude.insert("Zebra Game".to_string());
        settings.exclude.insert("Alpha Game".to_string());
        let json = serde_json::to_value(&settings).unwrap();
        let exclude: Vec<&str> = json["exclude"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap())
            .collect();
        assert_eq!(exclude, vec!["Alpha Game", "Zebra Game"]);
    }

    #[test]
    fn test_legacy_key_migration() {
        let path = temp_path("tdm_settings_migration.json");
        std::fs::write(
            &path,
            r#"{"prioritize_by_ending_soonest": true, "priority": ["A"]}"#,
        )
        .unwrap();

        let mut loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.priority_algorithm, PriorityAlgorithm::EndingSoonest);
        assert!(loaded.is_altered());

        // migration is idempotent: saving and reloading changes nothing
        loaded.save(false).unwrap();
        let reloaded = Settings::load_from(&path).unwrap();
        assert_eq!(reloaded.priority_algorithm, PriorityAlgorithm::EndingSoonest);
        assert!(!reloaded.is_altered());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_legacy_key_false_is_deleted_without_switch() {
        let path = temp_path("tdm_settings_migration_false.json");
        std::fs::write(&path, r#"{"prioritize_by_ending_soonest": false}"#).unwrap();
        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded.priority_algorithm, PriorityAlgorithm::List);
        assert!(loaded.is_altered());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_user_priority_is_reverse_index() {
        let mut settings = Settings::default();
        settings.priority = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        assert_eq!(settings.user_priority("A"), 3);
        assert_eq!(settings.user_priority("B"), 2);
        assert_eq!(settings.user_priority("C"), 1);
        assert_eq!(settings.user_priority("Absent"), 0);
    }

    #[test]
    fn test_dirty_flag_elides_writes() {
        let path = temp_path("tdm_settings_dirty.json");
        let mut settings = Settings::default();
        settings.path = Some(path.clone());
        // not altered: no file appears
        settings.save(false).unwrap();
        assert!(!path.exists());
        settings.alter();
        settings.save(false).unwrap();
        assert!(path.exists());
        assert!(!settings.is_altered());
        let _ = std::fs::remove_file(&path);
    }
}
