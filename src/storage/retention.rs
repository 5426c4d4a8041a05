//! Retention policy and sweeps.
//!
//! A sweep drops records older than `max_age_days`, then truncates every
//! series to its newest `max_records`. Each sweep runs inside one
//! transaction so concurrent readers never observe a half-swept series.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule as CronSchedule;
use rusqlite::{params, Transaction};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::error::{AnalyticsError, Result};
use crate::storage::DataStore;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetentionPolicy {
    #[serde(alias = "max_age_days")]
    pub max_age_days: u32,
    /// Per-series cap.
    #[serde(alias = "max_records")]
    pub max_records: usize,
    #[serde(alias = "compression_threshold_days")]
    pub compression_threshold_days: u32,
    #[serde(alias = "archive_threshold_days")]
    pub archive_threshold_days: u32,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: 90,
            max_records: 10_000,
            compression_threshold_days: 30,
            archive_threshold_days: 60,
        }
    }
}

impl RetentionPolicy {
    /// Records with a timestamp strictly before this instant are expired.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - Duration::days(self.max_age_days as i64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_records == 0 {
            return Err(AnalyticsError::Validation("retention maxRecords must be at least 1".into()));
        }
        if self.compression_threshold_days > self.archive_threshold_days {
            return Err(AnalyticsError::Validation(
                "retention compressionThresholdDays must not exceed archiveThresholdDays".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetentionReport {
    pub removed_suites: usize,
    pub removed_tests: usize,
}

impl RetentionReport {
    pub fn is_empty(&self) -> bool {
        self.removed_suites == 0 && self.removed_tests == 0
    }

    fn merge(&mut self, other: RetentionReport) {
        self.removed_suites += other.removed_suites;
        self.removed_tests += other.removed_tests;
    }
}

/// Sweep every series in one pass.
pub fn sweep_all(tx: &Transaction<'_>, policy: &RetentionPolicy, now: DateTime<Utc>) -> rusqlite::Result<RetentionReport> {
    let cutoff_ms = policy.cutoff(now).timestamp_millis();
    let keep = policy.max_records as i64;

    // 1. Age
    let mut removed_suites = tx.execute("DELETE FROM suite_records WHERE timestamp_ms < ?1", params![cutoff_ms])?;
    let mut removed_tests = tx.execute("DELETE FROM test_records WHERE timestamp_ms < ?1", params![cutoff_ms])?;

    // 2. Per-series cap, newest kept
    removed_suites += tx.execute(
        "DELETE FROM suite_records WHERE id IN (
            SELECT id FROM (
                SELECT id, ROW_NUMBER() OVER (
                    PARTITION BY suite_name ORDER BY timestamp_ms DESC, id DESC
                ) AS rn
                FROM suite_records
            ) WHERE rn > ?1
        )",
        params![keep],
    )?;
    removed_tests += tx.execute(
        "DELETE FROM test_records WHERE id IN (
            SELECT id FROM (
                SELECT id, ROW_NUMBER() OVER (
                    PARTITION BY test_file, test_name ORDER BY timestamp_ms DESC, id DESC
                ) AS rn
                FROM test_records
            ) WHERE rn > ?1
        )",
        params![keep],
    )?;

    Ok(RetentionReport {
        removed_suites,
        removed_tests,
    })
}

/// Sweep the series of one suite.
pub fn sweep_suite_series(
    tx: &Transaction<'_>,
    suite_name: &str,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> rusqlite::Result<RetentionReport> {
    let cutoff_ms = policy.cutoff(now).timestamp_millis();
    let mut removed = tx.execute(
        "DELETE FROM suite_records WHERE suite_name = ?1 AND timestamp_ms < ?2",
        params![suite_name, cutoff_ms],
    )?;
    removed += tx.execute(
        "DELETE FROM suite_records WHERE id IN (
            SELECT id FROM suite_records WHERE suite_name = ?1
            ORDER BY timestamp_ms DESC, id DESC LIMIT -1 OFFSET ?2
        )",
        params![suite_name, policy.max_records as i64],
    )?;
    Ok(RetentionReport {
        removed_suites: removed,
        removed_tests: 0,
    })
}

/// Sweep the series of one test (file + name).
pub fn sweep_test_series(
    tx: &Transaction<'_>,
    file: &str,
    name: &str,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> rusqlite::Result<RetentionReport> {
    let cutoff_ms = policy.cutoff(now).timestamp_millis();
    let mut removed = tx.execute(
        "DELETE FROM test_records WHERE test_file = ?1 AND test_name = ?2 AND timestamp_ms < ?3",
        params![file, name, cutoff_ms],
    )?;
    removed += tx.execute(
        "DELETE FROM test_records WHERE id IN (
            SELECT id FROM test_records WHERE test_file = ?1 AND test_name = ?2
            ORDER BY timestamp_ms DESC, id DESC LIMIT -1 OFFSET ?3
        )",
        params![file, name, policy.max_records as i64],
    )?;
    Ok(RetentionReport {
        removed_suites: 0,
        removed_tests: removed,
    })
}

/// Sweep the suite series and every test series touched by one stored run.
pub fn sweep_touched_series(
    tx: &Transaction<'_>,
    suite_name: &str,
    test_keys: &[(String, String)],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> rusqlite::Result<RetentionReport> {
    let mut report = sweep_suite_series(tx, suite_name, policy, now)?;
    for (file, name) in test_keys {
        report.merge(sweep_test_series(tx, file, name, policy, now)?);
    }
    Ok(report)
}

/// Spawn the periodic background sweep. `schedule` is a 6-field cron
/// expression (seconds first), e.g. `0 0 * * * *` for hourly.
pub fn spawn_retention_loop(store: Arc<DataStore>, schedule: &str) -> Result<JoinHandle<()>> {
    let schedule = CronSchedule::from_str(schedule)
        .map_err(|e| AnalyticsError::Validation(format!("invalid sweep schedule '{}': {}", schedule, e)))?;

    Ok(tokio::spawn(async move {
        info!("Retention sweeper started");
        loop {
            let now = Utc::now();
            let Some(next) = schedule.after(&now).next() else {
                info!("Retention schedule has no further runs; sweeper exiting");
                return;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            tokio::time::sleep(wait).await;

            let store = store.clone();
            match tokio::task::spawn_blocking(move || store.enforce_retention()).await {
                Ok(Ok(report)) => {
                    info!(removed_suites = report.removed_suites, removed_tests = report.removed_tests, "Retention sweep finished");
                }
                Ok(Err(e)) => error!("Retention sweep failed: {}", e),
                Err(e) => error!("Retention sweep task panicked: {}", e),
            }
        }
    }))
}
