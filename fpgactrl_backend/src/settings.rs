//! Worker settings, kept in a TOML file next to the connection table.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use fpgacompiler_backend::{BoardConfig, Role};

use crate::client::{Timeouts, DEFAULT_CHUNK_BYTES};
use crate::error::SettingsError;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub connect_timeout_ms: u64,
    pub op_timeout_ms: u64,
    /// Timeout of every wait at a barrier between workers.
    pub barrier_timeout_ms: u64,
    /// Interval between two status polls while running.
    pub poll_interval_ms: u64,
    /// Slack on top of the stream duration before a running board counts as stuck.
    pub run_margin_ms: u64,
    /// Bytes per send of the WRITE payload.
    pub chunk_bytes: usize,
    /// Abort ends with CLOSE when set, with RESET and a status sweep otherwise.
    pub close_on_abort: bool,
    /// Directory of the event sockets of workers in separate processes.
    pub event_dir: PathBuf,
    pub boards: IndexMap<String, BoardConfig>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 1000,
            op_timeout_ms: 5000,
            barrier_timeout_ms: 5000,
            poll_interval_ms: 10,
            run_margin_ms: 5000,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            close_on_abort: true,
            event_dir: std::env::temp_dir(),
            boards: IndexMap::new(),
        }
    }
}

impl WorkerSettings {
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_timeout_ms),
            operation: Duration::from_millis(self.op_timeout_ms),
        }
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn run_margin(&self) -> Duration {
        Duration::from_millis(self.run_margin_ms)
    }

    /// Checks every board and that the roles and peers of the board table agree.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.op_timeout_ms == 0 || self.barrier_timeout_ms == 0 {
            return Err(SettingsError::Invalid("timeouts must be positive".to_string()));
        }
        for (name, board) in &self.boards {
            if name != &board.name {
                return Err(SettingsError::Invalid(format!(
                    "board table entry {} holds board {}",
                    name, board.name
                )));
            }
            board
                .validate()
                .map_err(|e| SettingsError::Invalid(e.to_string()))?;
            for peer in &board.peers {
                let Some(other) = self.boards.get(peer) else {
                    continue;
                };
                if other.role == board.role {
                    return Err(SettingsError::Invalid(format!(
                        "{} and its peer {} are both {}",
                        name, peer, board.role
                    )));
                }
            }
        }
        let primaries = self
            .boards
            .values()
            .filter(|b| b.role == Role::Primary)
            .count();
        if self.boards.len() > 1 && primaries != 1 {
            return Err(SettingsError::Invalid(format!(
                "{} primary boards in a table of {}",
                primaries,
                self.boards.len()
            )));
        }
        Ok(())
    }

    pub fn from_toml_str(toml_string: &str) -> Result<Self, SettingsError> {
        let settings: WorkerSettings = toml::from_str(toml_string)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn to_toml_string(&self) -> Result<String, SettingsError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reads and validates a settings file.
    pub fn from_toml(path: &Path) -> Result<Self, SettingsError> {
        let mut toml_string = String::new();
        File::open(path)?.read_to_string(&mut toml_string)?;
        let settings = Self::from_toml_str(&toml_string)?;
        log::info!("Read settings of {} boards from {}", settings.boards.len(), path.display());
        Ok(settings)
    }

    /// Writes the settings, appending `.toml` to the file name if missing.
    pub fn to_toml(&self, path: &Path) -> Result<PathBuf, SettingsError> {
        let mut path = path.to_path_buf();
        if path.extension().map_or(true, |ext| ext != "toml") {
            path.set_extension("toml");
        }
        let mut file = File::create(&path)?;
        file.write_all(self.to_toml_string()?.as_bytes())?;
        log::debug!("Wrote settings to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod test {
    mod toml_file {
        use fpgacompiler_backend::{BoardConfig, Role};

        use crate::error::SettingsError;
        use crate::settings::*;

        fn two_boards() -> WorkerSettings {
            let mut settings = WorkerSettings::default();
            let main = BoardConfig::new("main", "10.0.0.2", 1e6, 2, Role::Primary);
            let mut aux = BoardConfig::new("aux", "10.0.0.3:49702", 1e6, 1, Role::Secondary);
            aux.peers = vec!["main".to_string()];
            settings.boards.insert("main".to_string(), main);
            settings.boards.insert("aux".to_string(), aux);
            settings
        }

        #[test]
        fn round_trip() {
            let settings = two_boards();
            let text = settings.to_toml_string().unwrap();
            assert!(text.contains("barrier_timeout_ms = 5000"));
            let back = WorkerSettings::from_toml_str(&text).unwrap();
            assert_eq!(back, settings);
        }

        #[test]
        fn defaults_fill_gaps() {
            let settings = WorkerSettings::from_toml_str("op_timeout_ms = 200\n").unwrap();
            assert_eq!(settings.timeouts().operation, Duration::from_millis(200));
            assert_eq!(settings.barrier_timeout(), Duration::from_secs(5));
            assert!(settings.boards.is_empty());
        }

        #[test]
        fn rejects_inconsistent_tables() {
            let mut settings = two_boards();
            settings.boards["aux"].role = Role::Primary;
            settings.boards["aux"].peers.clear();
            assert!(matches!(settings.validate(), Err(SettingsError::Invalid(_))));
            assert!(matches!(
                WorkerSettings::from_toml_str("op_timeout_ms = \"fast\""),
                Err(SettingsError::Decode(_))
            ));
        }

        #[test]
        fn file() {
            let path = std::env::temp_dir().join(format!("fpgactrl_settings_{}", std::process::id()));
            let written = two_boards().to_toml(&path).unwrap();
            assert_eq!(written.extension().unwrap(), "toml");
            let back = WorkerSettings::from_toml(&written).unwrap();
            assert_eq!(back.boards["aux"].endpoint, "10.0.0.3:49702");
            std::fs::remove_file(written).unwrap();
        }
    }
}
