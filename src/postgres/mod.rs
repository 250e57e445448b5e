// ABOUTME: PostgreSQL backend for both database tiers
// ABOUTME: Connection setup, pooling, SQL generation and the PgStore implementation

pub mod connection;
pub mod convert;
pub mod pool;
pub mod sql;
pub mod store;

pub use connection::{pg_config, tls_connector};
pub use pool::ConnectionPool;
pub use store::PgStore;
