//! Database schema and migrations.
//!
//! Suite runs and their derived per-test runs live in two tables; series
//! (one per suite name, one per file+test name) are secondary indexes rather
//! than separate containers, so sweeps and aggregations are single passes.

use rusqlite::Connection;

pub const SCHEMA_VERSION: i64 = 2;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS suite_records (
            id TEXT PRIMARY KEY,
            suite_name TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            branch TEXT NOT NULL,
            status TEXT NOT NULL,
            total_tests INTEGER NOT NULL,
            failed_tests INTEGER NOT NULL,
            duration_ms REAL NOT NULL,
            record_json TEXT NOT NULL,
            stored_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS test_records (
            id INTEGER PRIMARY KEY,
            test_id TEXT NOT NULL,
            suite_id TEXT NOT NULL,
            suite_name TEXT NOT NULL,
            test_file TEXT NOT NULL,
            test_name TEXT NOT NULL,
            status TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            duration_ms REAL NOT NULL,
            branch TEXT NOT NULL,
            error_type TEXT,
            error_message TEXT,
            record_json TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS quality_models (
            metric TEXT PRIMARY KEY,
            model_json TEXT NOT NULL,
            saved_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_suite_series ON suite_records(suite_name, timestamp_ms DESC);
        CREATE INDEX IF NOT EXISTS idx_suite_timestamp ON suite_records(timestamp_ms);
        CREATE INDEX IF NOT EXISTS idx_suite_branch ON suite_records(branch);
        CREATE INDEX IF NOT EXISTS idx_test_series ON test_records(test_file, test_name, timestamp_ms DESC);
        CREATE INDEX IF NOT EXISTS idx_test_status ON test_records(status, timestamp_ms);
        CREATE INDEX IF NOT EXISTS idx_test_suite ON test_records(suite_id);",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM suite_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM test_records", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM quality_models", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
