use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use testsight::recommend::export::export_recommendations;
use testsight::recommend::{RecommendationFormat, Role};
use testsight::records::TestSuiteExecutionRecord;
use testsight::storage::ExportFormat;
use testsight::{AppConfig, Engine};

#[derive(Parser)]
#[command(
    name = "testsight",
    about = "Historical test-quality analytics: trends, anomalies, forecasts and recommendations",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (overrides TESTSIGHT_CONFIG and ./testsight.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database path (overrides the config file)
    #[arg(long, global = true)]
    db: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + analysis worker + retention sweeps)
    Serve {
        /// Bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Store execution records from a JSON file (one record, an array, or an export envelope)
    Ingest {
        #[arg(long)]
        file: PathBuf,
    },

    /// Print the full analysis report
    Report {
        /// Days of history to analyse
        #[arg(long)]
        window_days: Option<u32>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Print dashboard summary data
    Dashboard {
        #[arg(long)]
        json: bool,
    },

    /// Export stored history, recommendations and model statistics
    Export {
        /// json or csv
        #[arg(long, default_value = "json")]
        format: String,

        /// Output file path (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Print recommendations, optionally for one role
    Recommendations {
        /// developer, qa_engineer, team_lead, manager or devops
        #[arg(long)]
        role: Option<String>,

        #[arg(long, default_value = "10")]
        limit: usize,

        /// json, csv or markdown
        #[arg(long, default_value = "markdown")]
        format: String,
    },

    /// Print component health
    Health {
        #[arg(long)]
        json: bool,
    },

    /// Retrain the quality models and save them for later runs
    Train {
        /// Days of history to train on
        #[arg(long, default_value = "90")]
        days: u32,
    },
}

fn init_tracing(config: &AppConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::load_or_default(),
    };
    if let Some(db) = &cli.db {
        config.storage.db_path = db.clone();
    }
    Ok(config)
}

/// Records from a single record, an array of records, or an export envelope.
fn parse_records(payload: &str) -> Result<Vec<TestSuiteExecutionRecord>> {
    let value: serde_json::Value = serde_json::from_str(payload).context("input is not valid JSON")?;
    let records = match value {
        serde_json::Value::Array(_) => serde_json::from_value(value)?,
        serde_json::Value::Object(ref map) if map.contains_key("data") => {
            serde_json::from_value(map["data"].clone()).context("export envelope has malformed data")?
        }
        other => vec![serde_json::from_value(other).context("malformed execution record")?],
    };
    Ok(records)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli)?;
    init_tracing(&config);

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind = bind;
            }
            tracing::info!(bind = %config.api.bind, "Starting testsight daemon");
            testsight::serve(config).await?;
        }
        Commands::Ingest { file } => {
            let payload = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let records = parse_records(&payload)?;
            let engine = Engine::open(config)?;
            let total = records.len();
            for record in records {
                let id = record.id.clone();
                engine
                    .store()
                    .store_suite_record(&record)
                    .with_context(|| format!("record '{id}' rejected"))?;
            }
            println!("Stored {total} execution records.");
        }
        Commands::Report { window_days, json } => {
            let window = window_days.unwrap_or(config.analysis.default_window_days);
            let engine = Engine::open(config)?;
            let report = engine.analysis_report(window).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("\n=== testsight Analysis Report ({window} days) ===");
                if let Some(coverage) = &report.trends.coverage {
                    println!(
                        "{:<16} | {:<10} | {:>8.2}",
                        "Coverage",
                        coverage.overall.trend.as_str(),
                        coverage.overall.change
                    );
                    for line in &coverage.recommendations {
                        println!("  -> {line}");
                    }
                }
                if let Some(perf) = &report.trends.performance {
                    println!(
                        "{:<16} | {:<10} | {:>8.2}",
                        "Execution time",
                        perf.execution_time.trend.as_str(),
                        perf.execution_time.change
                    );
                }
                if let Some(quality) = &report.trends.quality {
                    println!(
                        "{:<16} | {:<10} | {:>8.2}",
                        "Pass rate",
                        quality.pass_rate.trend.as_str(),
                        quality.pass_rate.change
                    );
                }
                if let Some(risk) = &report.risk {
                    println!("\nOverall risk: {:?} ({:.0})", risk.overall_risk, risk.risk_score);
                }
                println!("\nInsights:");
                for insight in &report.insights {
                    println!(" - [{}] {}", insight.severity.as_str(), insight.title);
                }
                println!("\nRecommendations:");
                for rec in &report.recommendations {
                    println!(" - [{}] {}", rec.priority.as_str(), rec.title);
                }
                for err in &report.errors {
                    println!("\n(note) {}: {}", err.stage, err.message);
                }
                println!();
            }
        }
        Commands::Dashboard { json } => {
            let engine = Engine::open(config)?;
            let data = engine.dashboard_data().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&data)?);
            } else {
                println!("\n=== testsight Dashboard ===");
                println!("Runs stored:  {}", data.summary.total_records);
                println!("Storage size: {} bytes", data.summary.storage_size);
                println!(
                    "Trends:       coverage {:+.2}, exec time {:+.2}, pass rate {:+.3}",
                    data.recent_trends.coverage, data.recent_trends.performance, data.recent_trends.quality
                );
                for alert in &data.alerts.critical {
                    println!("CRITICAL: {alert}");
                }
                for alert in &data.alerts.warnings {
                    println!("WARNING:  {alert}");
                }
                for rec in &data.top_recommendations {
                    println!(" - [{}] {}", rec.priority.as_str(), rec.title);
                }
                println!();
            }
        }
        Commands::Export { format, output } => {
            let format: ExportFormat = format.parse()?;
            let engine = Engine::open(config)?;
            let body = engine.export_analysis_data(format).await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Exported to {}", path.display());
                }
                None => println!("{body}"),
            }
        }
        Commands::Recommendations { role, limit, format } => {
            let format: RecommendationFormat = format.parse()?;
            let role = role.as_deref().map(str::parse::<Role>).transpose()?;
            let (window, horizon) = (config.analysis.default_window_days, config.analysis.prediction_horizon_days);
            let engine = Engine::open(config)?;
            let mut list = engine.recommender().generate_recommendations(window, horizon)?;
            match role {
                Some(role) => list = engine.recommender().get_personalized_recommendations(role, limit),
                None => list.truncate(limit),
            }
            println!("{}", export_recommendations(&list, format)?);
        }
        Commands::Health { json } => {
            let engine = Engine::open(config)?;
            let health = engine.system_health().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&health)?);
            } else {
                println!("\ntestsight health: {}", health.status.as_str());
                println!("{:<16} | {:<8} | Details", "Component", "Status");
                println!("{:-<16}-|-{:-<8}-|-{:-<40}", "", "", "");
                for (name, component) in &health.components {
                    println!("{:<16} | {:<8} | {}", name, component.status.as_str(), component.detail);
                }
                println!();
            }
        }
        Commands::Train { days } => {
            let engine = Engine::open(config)?;
            let stats = engine.train_models(days).await?;
            println!("{:<18} | {:>8} | Samples", "Model", "Accuracy");
            for s in stats {
                println!("{:<18} | {:>8.3} | {}", s.metric.to_string(), s.accuracy, s.samples);
            }
            println!("Models saved; later reports forecast with them.");
        }
    }

    Ok(())
}
