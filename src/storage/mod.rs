//! SQLite storage layer -- schema, the record store, retention and transfer.

pub mod retention;
pub mod schema;
pub mod store;
pub mod transfer;

use crate::error::Result;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;

pub use retention::{RetentionPolicy, RetentionReport};
pub use store::{
    AggregateBucket, AggregateMetric, DataStore, FailurePattern, FlakyTest, GroupBy, QueryFilter,
    SortField, SortOrder, StorageStats,
};
pub use transfer::ExportFormat;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

const PRAGMAS: &str = "PRAGMA journal_mode = WAL;
     PRAGMA synchronous = NORMAL;
     PRAGMA temp_store = MEMORY;
     PRAGMA foreign_keys = ON;
     PRAGMA busy_timeout = 5000;";

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| c.execute_batch(PRAGMAS));
    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Open a private in-memory database.
///
/// Every in-memory SQLite connection is its own database, so the pool holds
/// exactly one connection and never recycles it.
pub fn open_in_memory() -> Result<Pool> {
    let manager = SqliteConnectionManager::memory().with_init(|c| c.execute_batch("PRAGMA temp_store = MEMORY;"));
    let pool = R2D2Pool::builder()
        .max_size(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .build(manager)?;

    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}
