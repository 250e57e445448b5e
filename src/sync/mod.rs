// ABOUTME: Master/replica synchronization components
// ABOUTME: Connection manager, table pull, write routing, queue replay and scheduling

pub mod connection;
pub mod replayer;
pub mod router;
pub mod scheduler;
pub mod synchronizer;

pub use connection::{ConnectionManager, Deadlines, OnlineFlag};
pub use replayer::{PendingReplayer, ReplayStats};
pub use router::{MirrorStatus, WritePath, WriteReceipt, WriteRouter};
pub use scheduler::{CycleReport, SyncCycle, SyncScheduler, TableReport};
pub use synchronizer::TableSynchronizer;

use crate::error::{SyncError, SyncResult};
use crate::store::PENDING_TABLE;
use crate::utils::validate_identifier;

/// The fixed set of tables the engine mirrors.
///
/// Built once at startup; asking for a table outside the set is a
/// configuration error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRegistry {
    tables: Vec<String>,
}

impl TableRegistry {
    pub fn new<I, S>(tables: I) -> SyncResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = Vec::new();
        for table in tables {
            let table = table.into();
            validate_identifier(&table)?;
            if table == PENDING_TABLE {
                return Err(SyncError::Config(format!(
                    "'{}' cannot be registered as a synchronized table",
                    PENDING_TABLE
                )));
            }
            if !names.contains(&table) {
                names.push(table);
            }
        }
        if names.is_empty() {
            return Err(SyncError::Config(
                "no tables configured for synchronization".to_string(),
            ));
        }
        Ok(Self { tables: names })
    }

    /// Return the table name if it is registered.
    pub fn require<'a>(&self, table: &'a str) -> SyncResult<&'a str> {
        if self.contains(table) {
            Ok(table)
        } else {
            Err(SyncError::Config(format!(
                "table '{}' is not configured for synchronization",
                table
            )))
        }
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t == table)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_rejects_unknown_table() {
        let registry = TableRegistry::new(["users", "notes"]).unwrap();
        assert_eq!(registry.require("users").unwrap(), "users");
        assert!(matches!(
            registry.require("orders"),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn test_registry_validation() {
        assert!(TableRegistry::new(Vec::<String>::new()).is_err());
        assert!(TableRegistry::new(["pending_sync"]).is_err());
        assert!(TableRegistry::new(["bad name"]).is_err());

        let registry = TableRegistry::new(["users", "users", "notes"]).unwrap();
        assert_eq!(registry.iter().collect::<Vec<_>>(), vec!["users", "notes"]);
    }
}
