use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::ledger::{GridLedger, Principal};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerConfig {
    pub administrator: Principal,
    #[serde(default = "default_record_events")]
    pub record_events: bool,
}

fn default_record_events() -> bool {
    true
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("config has no administrator")]
    MissingAdministrator,
}

impl LedgerConfig {
    pub fn new(administrator: impl Into<Principal>) -> Self {
        Self {
            administrator: administrator.into(),
            record_events: true,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.administrator.trim().is_empty() {
            return Err(ConfigError::MissingAdministrator);
        }
        Ok(())
    }

    pub fn build(&self) -> GridLedger {
        GridLedger::new(self.administrator.clone()).with_event_journal(self.record_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    #[test]
    fn loads_and_defaults_journal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"administrator":"grid-operator"}}"#).unwrap();
        let config = LedgerConfig::load(file.path()).unwrap();
        assert_eq!(config, LedgerConfig::new("grid-operator"));
        let ledger = config.build();
        assert_eq!(ledger.administrator(), "grid-operator");
    }

    #[test]
    fn rejects_blank_administrator() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"administrator":"  ","record_events":false}}"#).unwrap();
        assert!(matches!(
            LedgerConfig::load(file.path()),
            Err(ConfigError::MissingAdministrator)
        ));
    }

    #[test]
    fn reports_parse_and_io_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            LedgerConfig::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            LedgerConfig::load(&dir.path().join("missing.json")),
            Err(ConfigError::Io { .. })
        ));
    }
}
