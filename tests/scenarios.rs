//! End-to-end scenarios over an in-memory engine.

mod common;

use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration, Utc};
use common::{jitter, suite_run, suite_run_at, test_case};
use testsight::analysis::{Severity, TrendDirection};
use testsight::events::EngineEvent;
use testsight::recommend::{normalize_title, Role, Status};
use testsight::records::TestStatus;
use testsight::storage::{ExportFormat, QueryFilter, RetentionPolicy};
use testsight::{AnalyticsError, AppConfig, Engine};

fn engine() -> Engine {
    Engine::in_memory(AppConfig::default()).unwrap()
}

fn engine_with_retention(policy: RetentionPolicy) -> Engine {
    let config = AppConfig {
        retention: policy,
        ..Default::default()
    };
    Engine::in_memory(config).unwrap()
}

#[test]
fn test_coverage_reversal_flips_trend_and_warns() {
    let engine = engine();
    let store = engine.store();
    let start = Utc::now() - Duration::days(23);

    for i in 0..20 {
        let mut run = suite_run_at(&format!("run-{i}"), start + Duration::days(i));
        run.coverage.statements = 80.0 + 8.0 * i as f64 / 19.0;
        store.store_suite_record(&run).unwrap();
    }
    let trends = engine.analyzer().coverage_trends(30).unwrap();
    assert_eq!(trends.statements.trend, TrendDirection::Increasing);
    assert!(trends.statements.slope > 0.0);
    assert!(trends.statements.correlation > 0.8);

    for (i, value) in [86.0, 84.0, 82.0].into_iter().enumerate() {
        let mut run = suite_run_at(&format!("drop-{i}"), start + Duration::days(20 + i as i64));
        run.coverage.statements = value;
        store.store_suite_record(&run).unwrap();
    }
    let trends = engine.analyzer().coverage_trends(30).unwrap();
    assert_eq!(trends.statements.trend, TrendDirection::Decreasing);
    assert!(trends.statements.reversal);
    assert!(
        trends
            .recommendations
            .iter()
            .any(|r| r.to_lowercase().contains("coverage is declining")),
        "recommendations: {:?}",
        trends.recommendations
    );
}

#[test]
fn test_duration_spike_is_high_severity_anomaly() {
    let engine = engine();
    let store = engine.store();
    for i in 0..20 {
        let mut run = suite_run(&format!("base-{i}"), 21 - i as i64);
        run.duration = 30.0 + 5.0 * jitter(i);
        store.store_suite_record(&run).unwrap();
    }
    let mut spike = suite_run("spike", 0);
    spike.duration = 120.0;
    store.store_suite_record(&spike).unwrap();

    let anomalies = engine.analyzer().detect_anomalies(30, 2.0).unwrap();
    let hit = anomalies
        .iter()
        .find(|a| a.metric == "execution_time" && a.record_id == "spike")
        .expect("spike not flagged");
    assert_eq!(hit.severity, Severity::High);
    assert_eq!(hit.actual_value, 120.0);
    assert!(!hit.possible_causes.is_empty());
    // Newest first.
    assert_eq!(anomalies[0].record_id, "spike");
}

#[test]
fn test_predictions_refuse_empty_history() {
    let engine = engine();
    let err = engine.predictor().predict_quality_metrics(7).unwrap_err();
    assert!(matches!(err, AnalyticsError::InsufficientData { .. }), "got {err:?}");
    assert!(engine.predictor().assess_quality_risk(7).unwrap_err().is_insufficient_data());
    assert!(engine.predictor().train_models(90).unwrap_err().is_insufficient_data());
    assert!(err.to_string().contains("need 1 more runs"));
}

#[test]
fn test_cached_predictions_are_equal_and_not_slower() {
    let engine = engine();
    for i in 0..25 {
        let mut run = suite_run(&format!("run-{i}"), 25 - i as i64);
        run.coverage = testsight::records::CoverageSnapshot::uniform(70.0 + i as f64 * 0.5);
        run.duration = 30.0 + jitter(i as usize);
        engine.store().store_suite_record(&run).unwrap();
    }

    let t0 = Instant::now();
    let first = engine.predictor().predict_quality_metrics(7).unwrap();
    let cold = t0.elapsed();
    let t1 = Instant::now();
    let second = engine.predictor().predict_quality_metrics(7).unwrap();
    let warm = t1.elapsed();

    assert_eq!(first, second);
    assert!(warm <= cold, "cached call took {warm:?}, original {cold:?}");
    assert_eq!(first.len(), 7);
    for p in &first {
        assert!(p.confidence > 0.0 && p.confidence <= 1.0, "{:?} confidence {}", p.metric, p.confidence);
    }
}

#[test]
fn test_store_invalidates_cached_analysis() {
    let engine = engine();
    engine.store().store_suite_record(&suite_run("a", 2)).unwrap();
    let before = engine.analyzer().performance_trends(30).unwrap();
    assert_eq!(before.execution_time.samples, 1);
    engine.store().store_suite_record(&suite_run("b", 1)).unwrap();
    let after = engine.analyzer().performance_trends(30).unwrap();
    assert_eq!(after.execution_time.samples, 2);
}

#[test]
fn test_retention_invariant_holds_for_every_series() {
    let policy = RetentionPolicy {
        max_age_days: 10,
        max_records: 5,
        compression_threshold_days: 3,
        archive_threshold_days: 5,
    };
    let engine = engine_with_retention(policy);
    let store = engine.store();

    for i in 0..16 {
        for suite in ["unit", "integration"] {
            let mut run = suite_run(&format!("{suite}-{i}"), 15 - i as i64);
            run.suite_name = suite.to_string();
            run.tests = vec![
                test_case(&run, "a.rs", "parses", TestStatus::Passed),
                test_case(&run, "b.rs", "renders", TestStatus::Failed),
            ];
            run.total_tests = 2;
            run.passed_tests = 1;
            run.failed_tests = 1;
            store.store_suite_record(&run).unwrap();
        }
    }

    let cutoff = Utc::now() - Duration::days(10);
    for suite in ["unit", "integration"] {
        let runs = store
            .query_records(&QueryFilter {
                suite_name: Some(suite.to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(runs.len() <= 5, "{suite} has {} runs", runs.len());
        assert!(runs.iter().all(|r| r.timestamp >= cutoff));
        assert!(runs.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }
    for (file, name) in [("a.rs", "parses"), ("b.rs", "renders")] {
        let tests = store
            .query_test_records(&QueryFilter {
                test_file: Some(file.to_string()),
                test_name: Some(name.to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(tests.len() <= 5, "{file}::{name} has {} runs", tests.len());
        assert!(tests.iter().all(|t| t.timestamp >= cutoff));
    }
}

#[test]
fn test_flakiness_arithmetic() {
    let engine = engine();
    let store = engine.store();
    for i in 0..5 {
        let mut run = suite_run(&format!("run-{i}"), 5 - i as i64);
        let status = if i % 2 == 1 { TestStatus::Failed } else { TestStatus::Passed };
        run.tests = vec![test_case(&run, "net.rs", "retries", status)];
        if i < 4 {
            // Four runs only, every one failing.
            run.tests.push(test_case(&run, "db.rs", "connects", TestStatus::Failed));
        }
        store.store_suite_record(&run).unwrap();
    }

    let flaky = store.flaky_tests(30, 0.4).unwrap();
    assert_eq!(flaky.len(), 1);
    assert_eq!(flaky[0].name, "retries");
    assert_eq!(flaky[0].flakiness, 0.4);
    assert_eq!(flaky[0].total_runs, 5);
    assert_eq!(flaky[0].failures, 2);

    assert_eq!(store.flaky_tests(30, 0.1).unwrap().len(), 1);
    assert!(store.flaky_tests(30, 0.41).unwrap().is_empty());
    assert!(store.flaky_tests(30, 0.0).unwrap().iter().all(|t| t.name != "connects"));
}

#[test]
fn test_lower_sensitivity_never_reports_fewer_anomalies() {
    let engine = engine();
    for i in 0..40 {
        let mut run = suite_run(&format!("run-{i}"), 40 - i as i64);
        run.duration = 30.0 + 4.0 * jitter(i) + if i % 9 == 0 { 25.0 } else { 0.0 };
        run.coverage = testsight::records::CoverageSnapshot::uniform(80.0 + jitter(i * 3));
        run.performance.peak_memory = 1e8 * (1.0 + 0.05 * jitter(i * 5));
        engine.store().store_suite_record(&run).unwrap();
    }

    let counts: Vec<usize> = [0.5, 1.0, 1.5, 2.0, 2.5, 3.0, 4.0]
        .into_iter()
        .map(|s| engine.analyzer().detect_anomalies(60, s).unwrap().len())
        .collect();
    assert!(counts.windows(2).all(|w| w[0] >= w[1]), "counts {counts:?}");
    assert!(counts[0] > 0);
}

#[test]
fn test_json_export_round_trip() {
    let engine = engine();
    let store = engine.store();
    for i in 0..6 {
        let mut run = suite_run(&format!("run-{i}"), 6 - i as i64);
        run.tests = vec![
            test_case(&run, "a.rs", "one", TestStatus::Passed),
            test_case(&run, "a.rs", "two", if i == 3 { TestStatus::Failed } else { TestStatus::Passed }),
        ];
        run.total_tests = 2;
        run.passed_tests = if i == 3 { 1 } else { 2 };
        run.failed_tests = if i == 3 { 1 } else { 0 };
        store.store_suite_record(&run).unwrap();
    }
    let before = store.query_records(&QueryFilter::default()).unwrap();
    let tests_before = store.query_test_records(&QueryFilter::default()).unwrap().len();

    let exported = store.export_data(ExportFormat::Json).unwrap();
    store.clear().unwrap();
    assert_eq!(store.suite_record_count().unwrap(), 0);

    let imported = store.import_data(ExportFormat::Json, &exported).unwrap();
    assert_eq!(imported, before.len());
    let after = store.query_records(&QueryFilter::default()).unwrap();
    assert_eq!(after, before);
    assert_eq!(store.query_test_records(&QueryFilter::default()).unwrap().len(), tests_before);
}

#[test]
fn test_recommendations_are_unique_and_tracked() {
    let engine = engine();
    for i in 0..8 {
        let mut run = suite_run(&format!("local-{i}"), 20 - 2 * i as i64);
        run.environment.ci = false;
        engine.store().store_suite_record(&run).unwrap();
    }

    let recommender = engine.recommender();
    let list = recommender.generate_recommendations(30, 7).unwrap();
    assert!(list.iter().any(|r| r.title == "Run tests in continuous integration"));
    let mut keys: Vec<String> = list.iter().map(|r| normalize_title(&r.title)).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), list.len());
    assert!(list.windows(2).all(|w| w[0].priority >= w[1].priority));

    let ci = list
        .iter()
        .find(|r| r.title == "Run tests in continuous integration")
        .unwrap()
        .clone();
    recommender.update_status(&ci.id, Status::Acknowledged).unwrap();

    // Regeneration keeps the id and status of the open recommendation.
    let again = recommender.generate_recommendations(30, 7).unwrap();
    let same = again.iter().find(|r| r.title == ci.title).unwrap();
    assert_eq!(same.id, ci.id);
    assert_eq!(same.status, Status::Acknowledged);

    recommender.update_status(&ci.id, Status::InProgress).unwrap();
    let done = recommender.update_status(&ci.id, Status::Completed).unwrap();
    assert!(done.completed_at.is_some());
    assert!(recommender.update_status(&ci.id, Status::New).is_err());

    let report = recommender.effectiveness_report();
    assert_eq!(report.completed, 1);
    assert!(report.completion_rate > 0.0);
    assert_eq!(report.impact_realized, done.estimated_impact);

    let err = recommender.update_status("missing", Status::Completed).unwrap_err();
    assert!(matches!(err, AnalyticsError::NotFound { .. }));
}

#[test]
fn test_recommendations_retire_when_trigger_clears() {
    let engine = engine();
    for i in 0..8 {
        let mut run = suite_run(&format!("local-{i}"), 20 - 2 * i as i64);
        run.environment.ci = false;
        engine.store().store_suite_record(&run).unwrap();
    }
    let recommender = engine.recommender();
    let title = "Run tests in continuous integration";
    let ci = recommender
        .generate_recommendations(30, 7)
        .unwrap()
        .into_iter()
        .find(|r| r.title == title)
        .unwrap();
    recommender.update_status(&ci.id, Status::Acknowledged).unwrap();

    engine.store().clear().unwrap();
    for i in 0..8 {
        engine
            .store()
            .store_suite_record(&suite_run(&format!("ci-{i}"), 20 - 2 * i as i64))
            .unwrap();
    }

    let fresh = recommender.generate_recommendations(30, 7).unwrap();
    assert!(!fresh.iter().any(|r| r.title == title));
    let personalized = recommender.get_personalized_recommendations(Role::TeamLead, 100);
    assert!(!personalized.iter().any(|r| r.title == title));
    assert!(matches!(
        recommender.get(&ci.id),
        Err(AnalyticsError::NotFound { .. })
    ));
}

#[test]
fn test_training_publishes_event_and_updates_stats() {
    let engine = engine();
    let mut events = engine.subscribe();
    for i in 0..40 {
        let mut run = suite_run(&format!("run-{i}"), 40 - i as i64);
        run.coverage = testsight::records::CoverageSnapshot::uniform(60.0 + i as f64 * 0.5);
        run.passed_tests = if i % 7 == 0 { 8 } else { 10 };
        run.failed_tests = 10 - run.passed_tests;
        engine.store().store_suite_record(&run).unwrap();
    }

    let stats = engine.predictor().train_models(60).unwrap();
    assert_eq!(stats.len(), 7);
    assert!(stats.iter().all(|s| s.trained_at.is_some() && s.samples > 0));
    assert!(stats.iter().all(|s| (0.0..=1.0).contains(&s.accuracy)));

    let mut retrained = false;
    while let Ok(event) = events.try_recv() {
        if let EngineEvent::ModelsRetrained { metrics, .. } = event {
            assert_eq!(metrics.len(), 7);
            retrained = true;
        }
    }
    assert!(retrained);

    let risk = engine.predictor().assess_quality_risk(7).unwrap();
    assert!((0.0..=100.0).contains(&risk.risk_score));
    assert_eq!(risk.predictions.len(), 7);
}

#[test]
fn test_trained_models_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        storage: testsight::config::StorageConfig {
            db_path: dir.path().join("nested").join("models.db").to_string_lossy().into_owned(),
            ..Default::default()
        },
        ..Default::default()
    };

    let trained = {
        let engine = Engine::open(config.clone()).unwrap();
        for i in 0..40 {
            let mut run = suite_run(&format!("run-{i}"), 40 - i as i64);
            run.coverage = testsight::records::CoverageSnapshot::uniform(60.0 + i as f64 * 0.5);
            engine.store().store_suite_record(&run).unwrap();
        }
        engine.predictor().train_models(60).unwrap()
    };

    let reopened = Engine::open(config).unwrap();
    let stats = reopened.predictor().model_stats();
    assert_eq!(stats.len(), trained.len());
    for (before, after) in trained.iter().zip(&stats) {
        assert_eq!(after.metric, before.metric);
        assert_eq!(after.trained_at, before.trained_at);
        assert_eq!(after.samples, before.samples);
        assert!((after.accuracy - before.accuracy).abs() < 1e-9);
    }
}

#[tokio::test]
async fn test_store_execution_triggers_background_insights() {
    let engine = engine();
    engine.start().unwrap();
    let mut events = engine.subscribe();

    engine.store_execution(suite_run("first", 1)).await.unwrap();

    let mut stored = false;
    let mut insights = false;
    let deadline = tokio::time::sleep(StdDuration::from_secs(5));
    tokio::pin!(deadline);
    while !(stored && insights) {
        tokio::select! {
            event = events.recv() => match event.unwrap() {
                EngineEvent::RecordStored { record_id, .. } => stored = record_id == "first",
                EngineEvent::InsightsReady { .. } => insights = true,
                _ => {}
            },
            _ = &mut deadline => break,
        }
    }
    assert!(stored, "no RecordStored event");
    assert!(insights, "no InsightsReady event");
    engine.shutdown();
}

#[tokio::test]
async fn test_full_report_and_dashboard() {
    let engine = engine();
    for i in 0..35 {
        let mut run = suite_run(&format!("run-{i}"), 35 - i as i64);
        run.duration = 30.0 + 3.0 * jitter(i);
        engine.store().store_suite_record(&run).unwrap();
    }

    let report = engine.analysis_report(30).await;
    assert!(report.errors.is_empty(), "errors: {:?}", report.errors);
    assert!(report.trends.coverage.is_some());
    assert_eq!(report.predictions.as_ref().map(Vec::len), Some(7));
    assert!(report.risk.is_some());

    let dashboard = engine.dashboard_data().await.unwrap();
    assert_eq!(dashboard.summary.total_records, 35);
    assert!(dashboard.top_recommendations.len() <= 5);

    let export = engine.export_analysis_data(ExportFormat::Json).await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&export).unwrap();
    assert_eq!(value["historicalData"]["totalRecords"], 35);
    assert!(value["modelStats"].is_array());
    assert!(value["recommendations"].is_array());

    let health = engine.system_health().await;
    assert!(health.components.contains_key("storage"));
    assert!(health.components.contains_key("predictor"));
}
