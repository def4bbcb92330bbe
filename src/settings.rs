use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use crate::lot::{DEFAULT_CAPACITY, DEFAULT_LANE_SIZE};

pub const CONFIG_PATH_ENV: &str = "PARKGENIUS_CONFIG";
pub const DEBUG_ENV: &str = "PARKGENIUS_DEBUG";
const DEFAULT_CONFIG_FILE: &str = "parkgenius.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StoreBackend {
    Memory,
    Sqlite { path: PathBuf },
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::Memory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase")]
pub struct LotSettings {
    pub capacity: usize,
    pub lane_size: usize,
    pub tick_interval_ms: u64,
    pub action_notice_ttl_ms: u64,
    pub reset_notice_ttl_ms: u64,
    /// Write `spots` with a revision check instead of last-writer-wins.
    pub conditional_writes: bool,
    pub store: StoreBackend,
}

impl Default for LotSettings {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            lane_size: DEFAULT_LANE_SIZE,
            tick_interval_ms: 1_000,
            action_notice_ttl_ms: 5_000,
            reset_notice_ttl_ms: 3_000,
            conditional_writes: false,
            store: StoreBackend::Memory,
        }
    }
}

impl LotSettings {
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            bail!("capacity must be at least 1");
        }
        if self.lane_size == 0 {
            bail!("laneSize must be at least 1");
        }
        if self.tick_interval_ms == 0 {
            bail!("tickIntervalMs must be greater than zero");
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn action_notice_ttl(&self) -> Duration {
        Duration::from_millis(self.action_notice_ttl_ms)
    }

    pub fn reset_notice_ttl(&self) -> Duration {
        Duration::from_millis(self.reset_notice_ttl_ms)
    }
}

/// Ticks between "still running" log lines from the tick loop.
pub fn heartbeat_every_ticks() -> u32 {
    let debug_mode = std::env::var(DEBUG_ENV)
        .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if debug_mode {
        1
    } else {
        10
    }
}

pub fn default_config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<LotSettings>,
}

impl SettingsStore {
    /// A missing file means defaults; an unparsable one is logged and ignored.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                log::warn!(
                    "Ignoring malformed settings in {}: {err}",
                    path.display()
                );
                LotSettings::default()
            })
        } else {
            LotSettings::default()
        };
        data.validate()
            .with_context(|| format!("Invalid settings in {}", path.display()))?;

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn lot(&self) -> LotSettings {
        self.read().clone()
    }

    /// Validates, swaps in, and writes the file. Running controllers keep the
    /// settings they were built with.
    pub fn update_lot(&self, settings: LotSettings) -> Result<()> {
        settings.validate()?;
        {
            let mut guard = self.write();
            self.persist(&settings)?;
            *guard = settings;
        }
        Ok(())
    }

    fn persist(&self, data: &LotSettings) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    fn read(&self) -> RwLockReadGuard<'_, LotSettings> {
        match self.data.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, LotSettings> {
        match self.data.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("parkgenius-settings-{}.json", Uuid::new_v4()))
    }

    #[test]
    fn missing_file_yields_defaults() {
        let store = SettingsStore::new(temp_path()).unwrap();
        let lot = store.lot();
        assert_eq!(lot.capacity, 10);
        assert_eq!(lot.lane_size, 5);
        assert_eq!(lot.tick_interval(), Duration::from_secs(1));
        assert_eq!(lot.store, StoreBackend::Memory);
        assert!(!lot.conditional_writes);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let path = temp_path();
        fs::write(
            &path,
            r#"{"capacity": 20, "store": {"kind": "sqlite", "path": "/tmp/lot.sqlite3"}}"#,
        )
        .unwrap();

        let lot = SettingsStore::new(path.clone()).unwrap().lot();
        assert_eq!(lot.capacity, 20);
        assert_eq!(lot.lane_size, 5);
        assert_eq!(
            lot.store,
            StoreBackend::Sqlite {
                path: PathBuf::from("/tmp/lot.sqlite3")
            }
        );
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn updates_persist_across_reload() {
        let path = temp_path();
        let store = SettingsStore::new(path.clone()).unwrap();
        let updated = LotSettings {
            capacity: 12,
            conditional_writes: true,
            ..store.lot()
        };
        store.update_lot(updated.clone()).unwrap();
        assert_eq!(store.lot(), updated);

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"conditionalWrites\": true"));
        assert_eq!(SettingsStore::new(path.clone()).unwrap().lot(), updated);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn invalid_update_is_refused_and_not_written() {
        let path = temp_path();
        let store = SettingsStore::new(path.clone()).unwrap();
        let bad = LotSettings {
            lane_size: 0,
            ..store.lot()
        };
        assert!(store.update_lot(bad).is_err());
        assert_eq!(store.lot(), LotSettings::default());
        assert!(!path.exists());
    }

    #[test]
    fn rejects_zero_capacity() {
        let path = temp_path();
        fs::write(&path, r#"{"capacity": 0}"#).unwrap();
        assert!(SettingsStore::new(path.clone()).is_err());
        let _ = fs::remove_file(&path);
    }
}
