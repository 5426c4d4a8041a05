//! The historical record store.
//!
//! Owns every suite and test record. Writes go through [`DataStore::store_suite_record`],
//! which validates, persists the suite row and its derived test rows in one
//! transaction, publishes `RecordStored`, then sweeps the touched series.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Datelike, Duration, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AnalyticsError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::records::{
    validate_suite_record, CoverageSnapshot, PerformanceSnapshot, TestCaseExecutionRecord, TestStatus,
    TestSuiteExecutionRecord,
};
use crate::storage::retention::{self, RetentionPolicy, RetentionReport};
use crate::storage::{open_in_memory, open_pool, Pool};

/// Minimum runs in the window before a test's flakiness is computed.
pub const MIN_FLAKY_RUNS: i64 = 5;
/// Number of failure patterns returned.
pub const MAX_FAILURE_PATTERNS: i64 = 20;
/// Failure timestamps kept per flaky test.
const RECENT_FAILURES: i64 = 5;

// ---------------------------------------------------------------------------
// Query / aggregation types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    #[default]
    Timestamp,
    Duration,
    Name,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    fn sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QueryFilter {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub suite_name: Option<String>,
    pub test_file: Option<String>,
    pub test_name: Option<String>,
    pub status: Option<TestStatus>,
    pub branch: Option<String>,
    pub sort_by: Option<SortField>,
    pub sort_order: Option<SortOrder>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl QueryFilter {
    /// Records newer than `days` ago.
    pub fn since_days(days: u32) -> Self {
        Self {
            start_date: Some(Utc::now() - Duration::days(days as i64)),
            ..Default::default()
        }
    }

    fn limit_offset(&self) -> (i64, i64) {
        let limit = self.limit.map(|l| l as i64).unwrap_or(-1);
        let offset = self.offset.unwrap_or(0) as i64;
        (limit, offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupBy {
    Day,
    Week,
    Month,
    Suite,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateMetric {
    AverageDuration,
    TotalDuration,
    AverageCoverage,
    AveragePerformance,
    PeakPerformance,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateBucket {
    pub key: String,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_coverage: Option<CoverageSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_performance: Option<PerformanceSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_performance: Option<PerformanceSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailurePattern {
    pub error_type: String,
    pub message: String,
    pub count: usize,
    pub affected_tests: usize,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlakyTest {
    pub file: String,
    pub name: String,
    pub total_runs: usize,
    pub failures: usize,
    pub flakiness: f64,
    /// Newest first.
    pub recent_failures: Vec<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageStats {
    pub total_suite_records: usize,
    pub total_test_records: usize,
    pub suite_series: usize,
    pub test_series: usize,
    pub oldest_record: Option<DateTime<Utc>>,
    pub newest_record: Option<DateTime<Utc>>,
    /// Approximate serialized size of all records, in bytes.
    pub storage_size_bytes: u64,
    /// Suite records older than the compression threshold.
    pub compressible_records: usize,
    /// Suite records older than the archive threshold.
    pub archivable_records: usize,
}

// ---------------------------------------------------------------------------
// DataStore
// ---------------------------------------------------------------------------

pub struct DataStore {
    pool: Pool,
    policy: RwLock<RetentionPolicy>,
    events: EventBus,
    generation: AtomicU64,
}

impl DataStore {
    pub fn new(pool: Pool, policy: RetentionPolicy, events: EventBus) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            pool,
            policy: RwLock::new(policy),
            events,
            generation: AtomicU64::new(0),
        })
    }

    pub fn open(path: &str, policy: RetentionPolicy, events: EventBus) -> Result<Self> {
        info!(%path, "Opening record store");
        Self::new(open_pool(path)?, policy, events)
    }

    pub fn in_memory(policy: RetentionPolicy, events: EventBus) -> Result<Self> {
        Self::new(open_in_memory()?, policy, events)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Monotonic counter bumped by every mutation. Analysis caches key on it.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        *self.policy.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the retention policy and sweep immediately under the new one.
    pub fn update_retention_policy(&self, policy: RetentionPolicy) -> Result<RetentionReport> {
        policy.validate()?;
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
        info!(?policy, "Retention policy updated");
        self.enforce_retention()
    }

    // -- ingest -------------------------------------------------------------

    /// Validate and store one suite run plus its derived test runs.
    pub fn store_suite_record(&self, record: &TestSuiteExecutionRecord) -> Result<()> {
        validate_suite_record(record)?;

        let policy = self.retention_policy();
        let suite_json = serde_json::to_string(record)?;
        let mut test_keys: Vec<(String, String)> = Vec::with_capacity(record.tests.len());

        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        // Re-storing an id replaces the run and its derived tests.
        tx.execute("DELETE FROM test_records WHERE suite_id = ?1", params![record.id])?;
        tx.execute(
            "INSERT OR REPLACE INTO suite_records (
                id, suite_name, timestamp_ms, branch, status, total_tests, failed_tests, duration_ms, record_json
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.suite_name,
                record.timestamp.timestamp_millis(),
                record.environment.branch,
                record.status().as_str(),
                record.total_tests,
                record.failed_tests,
                record.duration,
                suite_json
            ],
        )?;

        {
            let mut insert = tx.prepare(
                "INSERT INTO test_records (
                    test_id, suite_id, suite_name, test_file, test_name, status, timestamp_ms,
                    duration_ms, branch, error_type, error_message, record_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for test in &record.tests {
                let test_json = serde_json::to_string(test)?;
                insert.execute(params![
                    test.id,
                    record.id,
                    record.suite_name,
                    test.file,
                    test.name,
                    test.status.as_str(),
                    test.timestamp.timestamp_millis(),
                    test.duration,
                    test.environment.branch,
                    test.error.as_ref().map(|e| e.error_type.as_str()),
                    test.error.as_ref().map(|e| e.message.as_str()),
                    test_json
                ])?;
                let key = (test.file.clone(), test.name.clone());
                if !test_keys.contains(&key) {
                    test_keys.push(key);
                }
            }
        }
        tx.commit()?;
        self.bump_generation();

        debug!(suite = %record.suite_name, id = %record.id, tests = record.tests.len(), "Stored suite record");
        self.events.publish(EngineEvent::RecordStored {
            suite_name: record.suite_name.clone(),
            record_id: record.id.clone(),
            tests: record.tests.len(),
        });

        // Retention for the touched series. The record is already committed,
        // so a failed sweep is logged and left to the background loop.
        let swept = conn.transaction().map_err(AnalyticsError::from).and_then(|tx| {
            let report = retention::sweep_touched_series(&tx, &record.suite_name, &test_keys, &policy, Utc::now())?;
            tx.commit()?;
            Ok(report)
        });
        match swept {
            Ok(report) => self.after_sweep(report),
            Err(e) => warn!(suite = %record.suite_name, error = %e, "Post-store retention sweep failed"),
        }

        Ok(())
    }

    /// One-pass retention sweep over every series.
    pub fn enforce_retention(&self) -> Result<RetentionReport> {
        let policy = self.retention_policy();
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let report = retention::sweep_all(&tx, &policy, Utc::now())?;
        tx.commit()?;
        self.after_sweep(report);
        Ok(report)
    }

    fn after_sweep(&self, report: RetentionReport) {
        if report.is_empty() {
            return;
        }
        self.bump_generation();
        info!(removed_suites = report.removed_suites, removed_tests = report.removed_tests, "Retention removed records");
        self.events.publish(EngineEvent::RetentionCompleted {
            removed_suites: report.removed_suites,
            removed_tests: report.removed_tests,
        });
    }

    /// Remove every record.
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM test_records", [])?;
        tx.execute("DELETE FROM suite_records", [])?;
        tx.commit()?;
        self.bump_generation();
        info!("Record store cleared");
        Ok(())
    }

    // -- queries ------------------------------------------------------------

    /// Suite runs matching `filter`. Test file/name/status filters select
    /// suites containing a matching test run.
    pub fn query_records(&self, filter: &QueryFilter) -> Result<Vec<TestSuiteExecutionRecord>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Value> = Vec::new();

        push_range(&mut clauses, &mut args, "s.timestamp_ms", filter);
        if let Some(suite) = &filter.suite_name {
            args.push(Value::Text(suite.clone()));
            clauses.push(format!("s.suite_name = ?{}", args.len()));
        }
        if let Some(branch) = &filter.branch {
            args.push(Value::Text(branch.clone()));
            clauses.push(format!("s.branch = ?{}", args.len()));
        }

        if filter.test_file.is_some() || filter.test_name.is_some() {
            let mut inner = vec!["t.suite_id = s.id".to_string()];
            if let Some(file) = &filter.test_file {
                args.push(Value::Text(file.clone()));
                inner.push(format!("t.test_file = ?{}", args.len()));
            }
            if let Some(name) = &filter.test_name {
                args.push(Value::Text(name.clone()));
                inner.push(format!("t.test_name = ?{}", args.len()));
            }
            if let Some(status) = filter.status {
                args.push(Value::Text(status.as_str().to_string()));
                inner.push(format!("t.status = ?{}", args.len()));
            }
            clauses.push(format!(
                "EXISTS (SELECT 1 FROM test_records t WHERE {})",
                inner.join(" AND ")
            ));
        } else if let Some(status) = filter.status {
            args.push(Value::Text(status.as_str().to_string()));
            clauses.push(format!("s.status = ?{}", args.len()));
        }

        let order_col = match filter.sort_by.unwrap_or_default() {
            SortField::Timestamp => "s.timestamp_ms",
            SortField::Duration => "s.duration_ms",
            SortField::Name => "s.suite_name",
        };
        let sql = format!(
            "SELECT s.record_json FROM suite_records s {} ORDER BY {} {}, s.timestamp_ms DESC, s.id ASC {}",
            where_sql(&clauses),
            order_col,
            filter.sort_order.unwrap_or_default().sql(),
            limit_sql(&mut args, filter),
        );

        self.load_json_rows(&sql, args)
    }

    /// Per-test runs matching `filter`.
    pub fn query_test_records(&self, filter: &QueryFilter) -> Result<Vec<TestCaseExecutionRecord>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Value> = Vec::new();

        push_range(&mut clauses, &mut args, "timestamp_ms", filter);
        let text_filters = [
            ("suite_name", filter.suite_name.clone()),
            ("test_file", filter.test_file.clone()),
            ("test_name", filter.test_name.clone()),
            ("branch", filter.branch.clone()),
            ("status", filter.status.map(|s| s.as_str().to_string())),
        ];
        for (column, value) in text_filters {
            if let Some(v) = value {
                args.push(Value::Text(v));
                clauses.push(format!("{} = ?{}", column, args.len()));
            }
        }

        let order_col = match filter.sort_by.unwrap_or_default() {
            SortField::Timestamp => "timestamp_ms",
            SortField::Duration => "duration_ms",
            SortField::Name => "test_name",
        };
        let sql = format!(
            "SELECT record_json FROM test_records {} ORDER BY {} {}, timestamp_ms DESC, id ASC {}",
            where_sql(&clauses),
            order_col,
            filter.sort_order.unwrap_or_default().sql(),
            limit_sql(&mut args, filter),
        );

        self.load_json_rows(&sql, args)
    }

    /// Suite runs from the last `days` days, newest first.
    pub fn recent_suite_records(&self, days: u32) -> Result<Vec<TestSuiteExecutionRecord>> {
        self.query_records(&QueryFilter::since_days(days))
    }

    /// The newest `limit` suite runs across all suites, newest first.
    pub fn latest_suite_records(&self, limit: usize) -> Result<Vec<TestSuiteExecutionRecord>> {
        self.query_records(&QueryFilter {
            limit: Some(limit),
            ..Default::default()
        })
    }

    pub fn suite_record_count(&self) -> Result<usize> {
        let conn = self.pool.get()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM suite_records", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// Replace the saved quality models. Each entry is a metric name and the
    /// model serialized as JSON.
    pub fn save_models(&self, models: &[(&str, String)]) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM quality_models", [])?;
        for (metric, json) in models {
            tx.execute(
                "INSERT INTO quality_models (metric, model_json) VALUES (?1, ?2)",
                params![metric, json],
            )?;
        }
        tx.commit()?;
        debug!(models = models.len(), "Saved quality models");
        Ok(())
    }

    pub fn load_models<T: serde::de::DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.load_json_rows("SELECT model_json FROM quality_models ORDER BY metric", Vec::new())
    }

    fn load_json_rows<T: serde::de::DeserializeOwned>(&self, sql: &str, args: Vec<Value>) -> Result<Vec<T>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(args), |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for json in rows {
            out.push(serde_json::from_str(&json?)?);
        }
        Ok(out)
    }

    // -- aggregation / mining ----------------------------------------------

    /// Bucket runs by `group_by` and compute the requested aggregates.
    /// `File` groups per-test runs; every other grouping uses suite runs.
    /// Buckets are sorted by key.
    pub fn aggregate(
        &self,
        group_by: GroupBy,
        metrics: &[AggregateMetric],
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<AggregateBucket>> {
        let filter = QueryFilter {
            start_date: range.map(|r| r.0),
            end_date: range.map(|r| r.1),
            ..Default::default()
        };

        let mut buckets: BTreeMap<String, Accumulator> = BTreeMap::new();
        if group_by == GroupBy::File {
            for t in self.query_test_records(&filter)? {
                buckets
                    .entry(t.file.clone())
                    .or_default()
                    .add(t.duration, &t.coverage, &t.performance);
            }
        } else {
            for s in self.query_records(&filter)? {
                let key = match group_by {
                    GroupBy::Day => s.timestamp.format("%Y-%m-%d").to_string(),
                    GroupBy::Week => {
                        let week = s.timestamp.iso_week();
                        format!("{}-W{:02}", week.year(), week.week())
                    }
                    GroupBy::Month => s.timestamp.format("%Y-%m").to_string(),
                    GroupBy::Suite => s.suite_name.clone(),
                    GroupBy::File => unreachable!("file grouping handled above"),
                };
                buckets.entry(key).or_default().add(s.duration, &s.coverage, &s.performance);
            }
        }

        Ok(buckets
            .into_iter()
            .map(|(key, acc)| acc.finish(key, metrics))
            .collect())
    }

    /// Most frequent (error type, message) pairs among failed test runs.
    pub fn failure_patterns(&self, window_days: u32) -> Result<Vec<FailurePattern>> {
        let since = (Utc::now() - Duration::days(window_days as i64)).timestamp_millis();
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT COALESCE(error_type, 'Unknown'), COALESCE(error_message, ''), COUNT(*),
                    COUNT(DISTINCT test_file || '::' || test_name), MIN(timestamp_ms), MAX(timestamp_ms)
             FROM test_records
             WHERE status = 'failed' AND timestamp_ms >= ?1
             GROUP BY 1, 2
             ORDER BY 3 DESC, 6 DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![since, MAX_FAILURE_PATTERNS], |row| {
            Ok(FailurePattern {
                error_type: row.get(0)?,
                message: row.get(1)?,
                count: row.get::<_, i64>(2)? as usize,
                affected_tests: row.get::<_, i64>(3)? as usize,
                first_seen: from_millis(row.get(4)?),
                last_seen: from_millis(row.get(5)?),
            })
        })?;

        let mut patterns = Vec::new();
        for r in rows {
            patterns.push(r?);
        }
        Ok(patterns)
    }

    /// Tests whose failure ratio in the window is at least `threshold`.
    /// Tests with fewer than five runs are never reported.
    pub fn flaky_tests(&self, window_days: u32, threshold: f64) -> Result<Vec<FlakyTest>> {
        let since = (Utc::now() - Duration::days(window_days as i64)).timestamp_millis();
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT test_file, test_name, COUNT(*),
                    SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END)
             FROM test_records
             WHERE timestamp_ms >= ?1
             GROUP BY test_file, test_name
             HAVING COUNT(*) >= ?2",
        )?;
        let candidates: Vec<(String, String, i64, i64)> = stmt
            .query_map(params![since, MIN_FLAKY_RUNS], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let mut recent = conn.prepare(
            "SELECT timestamp_ms FROM test_records
             WHERE test_file = ?1 AND test_name = ?2 AND status = 'failed' AND timestamp_ms >= ?3
             ORDER BY timestamp_ms DESC LIMIT ?4",
        )?;

        let mut flaky = Vec::new();
        for (file, name, total, failures) in candidates {
            if failures == 0 {
                continue;
            }
            let flakiness = failures as f64 / total as f64;
            if flakiness < threshold {
                continue;
            }
            let recent_failures = recent
                .query_map(params![file, name, since, RECENT_FAILURES], |row| row.get::<_, i64>(0))?
                .map(|ms| ms.map(from_millis))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            flaky.push(FlakyTest {
                file,
                name,
                total_runs: total as usize,
                failures: failures as usize,
                flakiness,
                recent_failures,
            });
        }

        flaky.sort_by(|a, b| {
            b.flakiness
                .total_cmp(&a.flakiness)
                .then(b.failures.cmp(&a.failures))
                .then_with(|| a.file.cmp(&b.file))
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(flaky)
    }

    pub fn storage_stats(&self) -> Result<StorageStats> {
        let policy = self.retention_policy();
        let now = Utc::now();
        let compress_ms = (now - Duration::days(policy.compression_threshold_days as i64)).timestamp_millis();
        let archive_ms = (now - Duration::days(policy.archive_threshold_days as i64)).timestamp_millis();

        let conn = self.pool.get()?;
        let (suites, series, oldest, newest, suite_bytes, compressible, archivable): (
            i64,
            i64,
            Option<i64>,
            Option<i64>,
            i64,
            i64,
            i64,
        ) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT suite_name), MIN(timestamp_ms), MAX(timestamp_ms),
                    COALESCE(SUM(LENGTH(record_json)), 0),
                    COALESCE(SUM(CASE WHEN timestamp_ms < ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN timestamp_ms < ?2 THEN 1 ELSE 0 END), 0)
             FROM suite_records",
            params![compress_ms, archive_ms],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            },
        )?;
        let (tests, test_series, test_bytes): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT test_file || '::' || test_name),
                    COALESCE(SUM(LENGTH(record_json)), 0)
             FROM test_records",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(StorageStats {
            total_suite_records: suites as usize,
            total_test_records: tests as usize,
            suite_series: series as usize,
            test_series: test_series as usize,
            oldest_record: oldest.map(from_millis),
            newest_record: newest.map(from_millis),
            storage_size_bytes: (suite_bytes + test_bytes) as u64,
            compressible_records: compressible as usize,
            archivable_records: archivable as usize,
        })
    }

    /// Single suite run by id.
    pub fn get_suite_record(&self, id: &str) -> Result<TestSuiteExecutionRecord> {
        let conn = self.pool.get()?;
        let json: Option<String> = conn
            .query_row("SELECT record_json FROM suite_records WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(AnalyticsError::NotFound {
                kind: "suite record",
                id: id.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn push_range(clauses: &mut Vec<String>, args: &mut Vec<Value>, column: &str, filter: &QueryFilter) {
    if let Some(start) = filter.start_date {
        args.push(Value::Integer(start.timestamp_millis()));
        clauses.push(format!("{} >= ?{}", column, args.len()));
    }
    if let Some(end) = filter.end_date {
        args.push(Value::Integer(end.timestamp_millis()));
        clauses.push(format!("{} <= ?{}", column, args.len()));
    }
}

fn where_sql(clauses: &[String]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    }
}

fn limit_sql(args: &mut Vec<Value>, filter: &QueryFilter) -> String {
    let (limit, offset) = filter.limit_offset();
    args.push(Value::Integer(limit));
    args.push(Value::Integer(offset));
    format!("LIMIT ?{} OFFSET ?{}", args.len() - 1, args.len())
}

#[derive(Default)]
struct Accumulator {
    count: usize,
    duration: f64,
    coverage: CoverageSnapshot,
    performance: PerformanceSnapshot,
    peak: PerformanceSnapshot,
}

impl Accumulator {
    fn add(&mut self, duration: f64, coverage: &CoverageSnapshot, perf: &PerformanceSnapshot) {
        self.count += 1;
        self.duration += duration;
        self.coverage.statements += coverage.statements;
        self.coverage.branches += coverage.branches;
        self.coverage.functions += coverage.functions;
        self.coverage.lines += coverage.lines;
        self.performance.total_memory += perf.total_memory;
        self.performance.peak_memory += perf.peak_memory;
        self.performance.average_execution_time += perf.average_execution_time;
        self.peak.total_memory = self.peak.total_memory.max(perf.total_memory);
        self.peak.peak_memory = self.peak.peak_memory.max(perf.peak_memory);
        self.peak.average_execution_time = self.peak.average_execution_time.max(perf.average_execution_time);
    }

    fn finish(self, key: String, metrics: &[AggregateMetric]) -> AggregateBucket {
        let n = self.count.max(1) as f64;
        let wants = |m: AggregateMetric| metrics.contains(&m);
        AggregateBucket {
            key,
            count: self.count,
            average_duration: wants(AggregateMetric::AverageDuration).then(|| self.duration / n),
            total_duration: wants(AggregateMetric::TotalDuration).then_some(self.duration),
            average_coverage: wants(AggregateMetric::AverageCoverage).then(|| CoverageSnapshot {
                statements: self.coverage.statements / n,
                branches: self.coverage.branches / n,
                functions: self.coverage.functions / n,
                lines: self.coverage.lines / n,
            }),
            average_performance: wants(AggregateMetric::AveragePerformance).then(|| PerformanceSnapshot {
                total_memory: self.performance.total_memory / n,
                peak_memory: self.performance.peak_memory / n,
                average_execution_time: self.performance.average_execution_time / n,
            }),
            peak_performance: wants(AggregateMetric::PeakPerformance).then_some(self.peak),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{Environment, TestError};

    fn store() -> DataStore {
        DataStore::in_memory(RetentionPolicy::default(), EventBus::new()).unwrap()
    }

    fn test_run(file: &str, name: &str, status: TestStatus, ts: DateTime<Utc>) -> TestCaseExecutionRecord {
        TestCaseExecutionRecord {
            id: format!("{name}-{}", ts.timestamp_millis()),
            timestamp: ts,
            file: file.into(),
            name: name.into(),
            status,
            duration: 10.0,
            error: (status == TestStatus::Failed).then(|| TestError {
                error_type: "AssertionError".into(),
                message: "expected true".into(),
                stack: None,
            }),
            coverage: CoverageSnapshot::uniform(70.0),
            performance: PerformanceSnapshot::default(),
            environment: Environment::default(),
        }
    }

    fn suite_run(id: &str, suite: &str, ts: DateTime<Utc>, tests: Vec<TestCaseExecutionRecord>) -> TestSuiteExecutionRecord {
        let failed = tests.iter().filter(|t| t.status == TestStatus::Failed).count() as u32;
        let skipped = tests.iter().filter(|t| t.status == TestStatus::Skipped).count() as u32;
        let total = tests.len() as u32;
        TestSuiteExecutionRecord {
            id: id.into(),
            timestamp: ts,
            suite_name: suite.into(),
            total_tests: total,
            passed_tests: total - failed - skipped,
            failed_tests: failed,
            skipped_tests: skipped,
            duration: 100.0,
            coverage: CoverageSnapshot::uniform(80.0),
            performance: PerformanceSnapshot {
                total_memory: 1000.0,
                peak_memory: 500.0,
                average_execution_time: 5.0,
            },
            environment: Environment {
                platform: "linux".into(),
                ci: true,
                branch: "main".into(),
                commit: "abc123".into(),
            },
            tests,
        }
    }

    #[test]
    fn test_records_come_back_newest_first() {
        let s = store();
        let now = Utc::now();
        for i in 0..5 {
            let ts = now - Duration::hours(5 - i);
            s.store_suite_record(&suite_run(&format!("r{i}"), "unit", ts, vec![])).unwrap();
        }
        let records = s.query_records(&QueryFilter::default()).unwrap();
        assert_eq!(records.len(), 5);
        assert!(records.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
        assert_eq!(records[0].id, "r4");
    }

    #[test]
    fn test_store_fans_out_test_records() {
        let s = store();
        let now = Utc::now();
        let tests = vec![
            test_run("a.rs", "one", TestStatus::Passed, now),
            test_run("a.rs", "two", TestStatus::Failed, now),
        ];
        s.store_suite_record(&suite_run("r1", "unit", now, tests)).unwrap();

        let failed = s
            .query_test_records(&QueryFilter {
                status: Some(TestStatus::Failed),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].name, "two");
    }

    #[test]
    fn test_restore_same_id_replaces() {
        let s = store();
        let now = Utc::now();
        let run = suite_run("r1", "unit", now, vec![test_run("a.rs", "one", TestStatus::Passed, now)]);
        s.store_suite_record(&run).unwrap();
        s.store_suite_record(&run).unwrap();
        let stats = s.storage_stats().unwrap();
        assert_eq!(stats.total_suite_records, 1);
        assert_eq!(stats.total_test_records, 1);
    }

    #[test]
    fn test_invalid_record_not_stored() {
        let s = store();
        let mut run = suite_run("r1", "unit", Utc::now(), vec![]);
        run.coverage.lines = 150.0;
        assert!(matches!(s.store_suite_record(&run), Err(AnalyticsError::Validation(_))));
        assert_eq!(s.suite_record_count().unwrap(), 0);
    }

    #[test]
    fn test_query_filters_and_pagination() {
        let s = store();
        let now = Utc::now();
        for i in 0..6 {
            let suite = if i % 2 == 0 { "unit" } else { "e2e" };
            let mut run = suite_run(&format!("r{i}"), suite, now - Duration::minutes(i), vec![]);
            run.duration = 100.0 + i as f64;
            s.store_suite_record(&run).unwrap();
        }

        let unit = s
            .query_records(&QueryFilter {
                suite_name: Some("unit".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(unit.len(), 3);

        let page = s
            .query_records(&QueryFilter {
                sort_by: Some(SortField::Duration),
                sort_order: Some(SortOrder::Asc),
                limit: Some(2),
                offset: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["r1", "r2"]);
    }

    #[test]
    fn test_query_by_test_name_selects_suites() {
        let s = store();
        let now = Utc::now();
        s.store_suite_record(&suite_run("r1", "unit", now, vec![test_run("a.rs", "one", TestStatus::Passed, now)]))
            .unwrap();
        s.store_suite_record(&suite_run("r2", "unit", now, vec![test_run("b.rs", "two", TestStatus::Passed, now)]))
            .unwrap();
        let hits = s
            .query_records(&QueryFilter {
                test_name: Some("two".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "r2");
    }

    #[test]
    fn test_flakiness_requires_five_runs() {
        let s = store();
        let now = Utc::now();
        // "steady": 5 runs, 2 failures. "young": 4 runs, 3 failures.
        let steady = [true, false, true, false, true];
        for (i, pass) in steady.iter().enumerate() {
            let ts = now - Duration::hours(i as i64 + 1);
            let status = if *pass { TestStatus::Passed } else { TestStatus::Failed };
            let mut tests = vec![test_run("a.rs", "steady", status, ts)];
            if i < 4 {
                let young = if i == 0 { TestStatus::Passed } else { TestStatus::Failed };
                tests.push(test_run("a.rs", "young", young, ts));
            }
            s.store_suite_record(&suite_run(&format!("r{i}"), "unit", ts, tests)).unwrap();
        }

        let flaky = s.flaky_tests(7, 0.4).unwrap();
        assert_eq!(flaky.len(), 1);
        assert_eq!(flaky[0].name, "steady");
        assert_eq!(flaky[0].flakiness, 0.4);
        assert_eq!(flaky[0].recent_failures.len(), 2);
        assert!(s.flaky_tests(7, 0.0).unwrap().iter().all(|f| f.name != "young"));
        assert!(s.flaky_tests(7, 0.41).unwrap().is_empty());
    }

    #[test]
    fn test_failure_patterns_grouped() {
        let s = store();
        let now = Utc::now();
        for i in 0..3 {
            let ts = now - Duration::hours(i);
            let mut failing = test_run("a.rs", &format!("t{i}"), TestStatus::Failed, ts);
            if i == 2 {
                failing.error = Some(TestError {
                    error_type: "TimeoutError".into(),
                    message: "exceeded 5000ms".into(),
                    stack: None,
                });
            }
            s.store_suite_record(&suite_run(&format!("r{i}"), "unit", ts, vec![failing])).unwrap();
        }
        let patterns = s.failure_patterns(7).unwrap();
        assert_eq!(patterns.len(), 2);
        assert_eq!(patterns[0].error_type, "AssertionError");
        assert_eq!(patterns[0].count, 2);
        assert_eq!(patterns[0].affected_tests, 2);
        assert!(patterns[0].first_seen <= patterns[0].last_seen);
    }

    #[test]
    fn test_aggregate_by_suite_sorted_by_key() {
        let s = store();
        let now = Utc::now();
        s.store_suite_record(&suite_run("r1", "zeta", now, vec![])).unwrap();
        s.store_suite_record(&suite_run("r2", "alpha", now, vec![])).unwrap();
        s.store_suite_record(&suite_run("r3", "alpha", now - Duration::minutes(1), vec![])).unwrap();

        let buckets = s
            .aggregate(GroupBy::Suite, &[AggregateMetric::TotalDuration, AggregateMetric::AverageCoverage], None)
            .unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].key, "alpha");
        assert_eq!(buckets[0].count, 2);
        assert_eq!(buckets[0].total_duration, Some(200.0));
        assert_eq!(buckets[0].average_coverage.unwrap().lines, 80.0);
        assert!(buckets[0].average_duration.is_none());
    }

    #[test]
    fn test_aggregate_by_day_and_file() {
        let s = store();
        let now = Utc::now();
        let tests = vec![test_run("b.rs", "x", TestStatus::Passed, now), test_run("a.rs", "y", TestStatus::Passed, now)];
        s.store_suite_record(&suite_run("r1", "unit", now, tests)).unwrap();
        s.store_suite_record(&suite_run("r2", "unit", now - Duration::days(2), vec![])).unwrap();

        let days = s.aggregate(GroupBy::Day, &[AggregateMetric::PeakPerformance], None).unwrap();
        assert_eq!(days.len(), 2);
        assert!(days[0].key < days[1].key);
        assert_eq!(days[1].peak_performance.unwrap().peak_memory, 500.0);

        let files = s.aggregate(GroupBy::File, &[AggregateMetric::AverageDuration], None).unwrap();
        assert_eq!(files.iter().map(|b| b.key.as_str()).collect::<Vec<_>>(), vec!["a.rs", "b.rs"]);
    }

    #[test]
    fn test_retention_caps_series_on_store() {
        let policy = RetentionPolicy {
            max_records: 3,
            ..Default::default()
        };
        let s = DataStore::in_memory(policy, EventBus::new()).unwrap();
        let now = Utc::now();
        for i in 0..6 {
            let ts = now - Duration::minutes(10 - i);
            let tests = vec![test_run("a.rs", "one", TestStatus::Passed, ts)];
            s.store_suite_record(&suite_run(&format!("r{i}"), "unit", ts, tests)).unwrap();
        }
        let records = s.query_records(&QueryFilter::default()).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].id, "r5");
        assert_eq!(s.storage_stats().unwrap().total_test_records, 3);
    }

    #[test]
    fn test_store_succeeds_when_post_store_sweep_fails() {
        let policy = RetentionPolicy {
            max_records: 1,
            ..Default::default()
        };
        let s = DataStore::in_memory(policy, EventBus::new()).unwrap();
        s.pool
            .get()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER block_suite_delete BEFORE DELETE ON suite_records
                 BEGIN SELECT RAISE(ABORT, 'deletes blocked'); END;",
            )
            .unwrap();
        let now = Utc::now();
        s.store_suite_record(&suite_run("r0", "unit", now - Duration::minutes(2), vec![])).unwrap();
        s.store_suite_record(&suite_run("r1", "unit", now - Duration::minutes(1), vec![])).unwrap();

        assert_eq!(s.get_suite_record("r1").unwrap().id, "r1");
        assert_eq!(s.suite_record_count().unwrap(), 2);
    }

    #[test]
    fn test_retention_drops_expired() {
        let policy = RetentionPolicy {
            max_age_days: 10,
            ..Default::default()
        };
        let s = DataStore::in_memory(policy, EventBus::new()).unwrap();
        let mut rx = s.events().subscribe();
        let now = Utc::now();
        s.store_suite_record(&suite_run("old", "unit", now - Duration::days(11), vec![])).unwrap();
        assert_eq!(s.suite_record_count().unwrap(), 0);

        let mut saw_cleanup = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::RetentionCompleted { removed_suites, .. } = event {
                assert_eq!(removed_suites, 1);
                saw_cleanup = true;
            }
        }
        assert!(saw_cleanup);
    }

    #[test]
    fn test_tightened_policy_sweeps_everything() {
        let s = store();
        let now = Utc::now();
        for i in 0..4 {
            s.store_suite_record(&suite_run(&format!("r{i}"), "unit", now - Duration::days(i * 10), vec![])).unwrap();
        }
        let report = s
            .update_retention_policy(RetentionPolicy {
                max_age_days: 15,
                max_records: 1,
                compression_threshold_days: 5,
                archive_threshold_days: 10,
            })
            .unwrap();
        assert_eq!(report.removed_suites, 3);
        let left = s.query_records(&QueryFilter::default()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, "r0");
    }

    #[test]
    fn test_storage_stats_tiers() {
        let s = store();
        let now = Utc::now();
        s.store_suite_record(&suite_run("new", "unit", now, vec![])).unwrap();
        s.store_suite_record(&suite_run("mid", "unit", now - Duration::days(40), vec![])).unwrap();
        s.store_suite_record(&suite_run("old", "unit", now - Duration::days(70), vec![])).unwrap();
        let stats = s.storage_stats().unwrap();
        assert_eq!(stats.total_suite_records, 3);
        assert_eq!(stats.compressible_records, 2);
        assert_eq!(stats.archivable_records, 1);
        assert!(stats.storage_size_bytes > 0);
        assert!(stats.oldest_record < stats.newest_record);
    }

    #[test]
    fn test_generation_bumps_on_write() {
        let s = store();
        let g0 = s.generation();
        s.store_suite_record(&suite_run("r1", "unit", Utc::now(), vec![])).unwrap();
        assert!(s.generation() > g0);
    }

    #[test]
    fn test_get_unknown_record_is_not_found() {
        let s = store();
        assert!(matches!(s.get_suite_record("nope"), Err(AnalyticsError::NotFound { .. })));
    }
}
