//! JSON and CSV export/import of suite records.
//!
//! Imports go back through `store_suite_record`, so validation, derived test
//! rows and retention stay consistent with live ingestion.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AnalyticsError, Result};
use crate::records::{CoverageSnapshot, Environment, PerformanceSnapshot, TestSuiteExecutionRecord};
use crate::storage::{DataStore, QueryFilter, RetentionPolicy};

pub const CSV_HEADER: &str = "id,timestamp,suiteName,totalTests,passedTests,failedTests,skippedTests,duration,statements,branches,functions,lines,totalMemory,peakMemory,averageExecutionTime,platform,ci,branch,commit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

impl FromStr for ExportFormat {
    type Err = AnalyticsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(AnalyticsError::Validation(format!("unsupported export format '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEnvelope {
    pub export_date: DateTime<Utc>,
    pub total_records: usize,
    pub retention_policy: RetentionPolicy,
    pub data: Vec<TestSuiteExecutionRecord>,
}

impl DataStore {
    pub fn export_data(&self, format: ExportFormat) -> Result<String> {
        // Oldest first so a re-import replays history in order.
        let mut records = self.query_records(&QueryFilter::default())?;
        records.reverse();
        info!(?format, records = records.len(), "Exporting records");

        match format {
            ExportFormat::Json => {
                let envelope = ExportEnvelope {
                    export_date: Utc::now(),
                    total_records: records.len(),
                    retention_policy: self.retention_policy(),
                    data: records,
                };
                Ok(serde_json::to_string_pretty(&envelope)?)
            }
            ExportFormat::Csv => {
                let mut out = String::from(CSV_HEADER);
                out.push('\n');
                for r in &records {
                    out.push_str(&csv_row(r));
                    out.push('\n');
                }
                Ok(out)
            }
        }
    }

    /// Import previously exported data. Returns the number of suite records stored.
    pub fn import_data(&self, format: ExportFormat, payload: &str) -> Result<usize> {
        let records = match format {
            ExportFormat::Json => serde_json::from_str::<ExportEnvelope>(payload)?.data,
            ExportFormat::Csv => parse_csv(payload)?,
        };

        for record in &records {
            self.store_suite_record(record)?;
        }
        info!(?format, records = records.len(), "Imported records");
        Ok(records.len())
    }
}

fn csv_row(r: &TestSuiteExecutionRecord) -> String {
    let fields = [
        escape(&r.id),
        r.timestamp.to_rfc3339(),
        escape(&r.suite_name),
        r.total_tests.to_string(),
        r.passed_tests.to_string(),
        r.failed_tests.to_string(),
        r.skipped_tests.to_string(),
        r.duration.to_string(),
        r.coverage.statements.to_string(),
        r.coverage.branches.to_string(),
        r.coverage.functions.to_string(),
        r.coverage.lines.to_string(),
        r.performance.total_memory.to_string(),
        r.performance.peak_memory.to_string(),
        r.performance.average_execution_time.to_string(),
        escape(&r.environment.platform),
        r.environment.ci.to_string(),
        escape(&r.environment.branch),
        escape(&r.environment.commit),
    ];
    fields.join(",")
}

pub(crate) fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split a CSV payload into rows of fields. Quoted fields may contain
/// commas, doubled quotes and line breaks; a row ends only at a newline
/// outside quotes. Blank rows are dropped.
fn split_records(payload: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = payload.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', _) => quoted = !quoted,
            (',', false) => fields.push(std::mem::take(&mut current)),
            ('\r', false) if chars.peek() == Some(&'\n') => {}
            ('\n', false) => {
                fields.push(std::mem::take(&mut current));
                push_row(&mut rows, std::mem::take(&mut fields));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() || !fields.is_empty() {
        fields.push(current);
        push_row(&mut rows, fields);
    }
    rows
}

fn push_row(rows: &mut Vec<Vec<String>>, row: Vec<String>) {
    let blank = row.len() == 1 && row[0].trim().is_empty();
    if !blank {
        rows.push(row);
    }
}

fn parse_csv(payload: &str) -> Result<Vec<TestSuiteExecutionRecord>> {
    let mut rows = split_records(payload).into_iter();
    match rows.next() {
        Some(header) if header.join(",").trim() == CSV_HEADER => {}
        _ => return Err(AnalyticsError::Validation("CSV import: missing or unexpected header row".into())),
    }

    let mut records = Vec::new();
    for (i, f) in rows.enumerate() {
        let row = i + 2;
        if f.len() != 19 {
            return Err(AnalyticsError::Validation(format!(
                "CSV import: row {row} has {} fields, expected 19",
                f.len()
            )));
        }
        let num = |idx: usize| -> Result<f64> {
            f[idx]
                .parse::<f64>()
                .map_err(|_| AnalyticsError::Validation(format!("CSV import: row {row} column {} is not a number", idx + 1)))
        };
        let count = |idx: usize| -> Result<u32> {
            f[idx]
                .parse::<u32>()
                .map_err(|_| AnalyticsError::Validation(format!("CSV import: row {row} column {} is not a count", idx + 1)))
        };
        let timestamp = DateTime::parse_from_rfc3339(&f[1])
            .map_err(|e| AnalyticsError::Validation(format!("CSV import: row {row} timestamp: {e}")))?
            .with_timezone(&Utc);

        records.push(TestSuiteExecutionRecord {
            id: f[0].clone(),
            timestamp,
            suite_name: f[2].clone(),
            total_tests: count(3)?,
            passed_tests: count(4)?,
            failed_tests: count(5)?,
            skipped_tests: count(6)?,
            duration: num(7)?,
            coverage: CoverageSnapshot {
                statements: num(8)?,
                branches: num(9)?,
                functions: num(10)?,
                lines: num(11)?,
            },
            performance: PerformanceSnapshot {
                total_memory: num(12)?,
                peak_memory: num(13)?,
                average_execution_time: num(14)?,
            },
            environment: Environment {
                platform: f[15].clone(),
                ci: f[16] == "true",
                branch: f[17].clone(),
                commit: f[18].clone(),
            },
            tests: Vec::new(),
        });
    }
    Ok(records)
}
