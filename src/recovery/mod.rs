//! Recovery storage - where the controller remembers live interpreter processes
//!
//! Every launched process is recorded by group id. A restarted controller
//! reads the records back, probes each endpoint, and reattaches to the ones
//! that answer instead of launching new processes.

pub mod sqlite;

pub use sqlite::SqliteRecoveryStorage;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::Result;
use crate::config::{AtelierConfig, RecoveryKind};

/// Where a process group's interpreter process can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRegistration {
    pub group_id: String,
    pub host: String,
    pub port: u16,
    pub last_busy_at: DateTime<Utc>,
}

impl ProcessRegistration {
    pub fn new(group_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            group_id: group_id.into(),
            host: host.into(),
            port,
            last_busy_at: Utc::now(),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Durable group id → registration map. Single writer.
pub trait RecoveryStorage: Send + Sync {
    /// Record (or replace) a started process
    fn on_client_start(&self, registration: &ProcessRegistration) -> Result<()>;

    /// Forget a stopped process
    fn on_client_stop(&self, group_id: &str) -> Result<()>;

    /// Refresh a registration's last-busy timestamp
    fn touch(&self, group_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Every stored registration
    fn load_all(&self) -> Result<Vec<ProcessRegistration>>;
}

/// Recovery disabled: remembers nothing
pub struct NullRecoveryStorage;

impl RecoveryStorage for NullRecoveryStorage {
    fn on_client_start(&self, _registration: &ProcessRegistration) -> Result<()> {
        Ok(())
    }

    fn on_client_stop(&self, _group_id: &str) -> Result<()> {
        Ok(())
    }

    fn touch(&self, _group_id: &str, _at: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<ProcessRegistration>> {
        Ok(Vec::new())
    }
}

/// Open the storage backend `config` asks for.
pub fn create_recovery_storage(config: &AtelierConfig) -> Result<Arc<dyn RecoveryStorage>> {
    match config.recovery {
        RecoveryKind::Null => Ok(Arc::new(NullRecoveryStorage)),
        RecoveryKind::Sqlite => Ok(Arc::new(SqliteRecoveryStorage::open(&config.recovery_dir)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_storage_forgets_everything() {
        let storage = NullRecoveryStorage;
        storage
            .on_client_start(&ProcessRegistration::new("g1", "127.0.0.1", 4000))
            .unwrap();
        assert!(storage.load_all().unwrap().is_empty());
    }

    #[test]
    fn factory_picks_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AtelierConfig::default();
        config.recovery_dir = dir.path().to_path_buf();

        let storage = create_recovery_storage(&config).unwrap();
        storage
            .on_client_start(&ProcessRegistration::new("g1", "127.0.0.1", 4000))
            .unwrap();
        assert_eq!(storage.load_all().unwrap().len(), 1);

        config.recovery = RecoveryKind::Null;
        let storage = create_recovery_storage(&config).unwrap();
        assert!(storage.load_all().unwrap().is_empty());
    }

    #[test]
    fn endpoint_formatting() {
        assert_eq!(
            ProcessRegistration::new("g1", "localhost", 9000).endpoint(),
            "localhost:9000"
        );
    }
}
