// ABOUTME: Library root for replica-sync
// ABOUTME: Two-tier PostgreSQL synchronizer with offline writes and queued replay

pub mod config;
pub mod engine;
pub mod error;
pub mod postgres;
pub mod row;
pub mod store;
pub mod sync;
pub mod utils;

pub use config::{DatabaseConfig, EngineConfig, SyncConfig, TlsMode};
pub use engine::SyncEngine;
pub use error::{SyncError, SyncResult};
pub use row::Row;
pub use store::{
    LocalStore, MemoryStore, Operation, PendingOperation, PendingQueue, QueryResult, QueueStatus,
    Store,
};
pub use sync::{CycleReport, MirrorStatus, OnlineFlag, ReplayStats, WritePath, WriteReceipt};
