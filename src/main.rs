use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use vehicle_rca_agent::config::Config;
use vehicle_rca_agent::ingest;
use vehicle_rca_agent::pipeline::{AnalysisOutcome, Pipeline};
use vehicle_rca_agent::router::http::HttpAnalyzer;
use vehicle_rca_agent::sink::sqlite::SqliteSink;
use vehicle_rca_agent::sink::{MemorySink, RecordSink};

#[derive(Parser, Debug)]
#[command(name = "vehicle-rca-agent", about = "Vehicle telemetry anomaly gate with root-cause analysis")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/vehicle-rca-agent/config.toml")]
    config: String,

    /// Validate config and exit
    #[arg(long)]
    check: bool,

    /// Print version and exit
    #[arg(short, long)]
    version: bool,

    /// Ask one question instead of ingesting packets
    #[arg(long)]
    query: Option<String>,

    /// Run diagnostic, maintenance and performance analyses once and exit
    #[arg(long)]
    comprehensive: bool,

    /// Vehicle for --query and --comprehensive (defaults to agent.vehicle_id)
    #[arg(long)]
    vehicle: Option<String>,
}

#[tokio::main(worker_threads = 2)]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("vehicle-rca-agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(&cli.config)?;

    if cli.check {
        println!("Configuration is valid.");
        return Ok(());
    }

    init_logging(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        hostname = %config.agent.hostname,
        "Starting vehicle RCA agent"
    );

    if let Err(e) = run(cli, config).await {
        error!(error = %e, "Agent terminated with error");
        return Err(e);
    }

    Ok(())
}

fn init_logging(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.agent.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

fn open_sink(config: &Config) -> Result<Arc<dyn RecordSink>> {
    match &config.storage.sqlite_path {
        Some(path) => Ok(Arc::new(SqliteSink::open(path, config.storage.busy_timeout_ms)?)),
        None => {
            warn!("No storage.sqlite_path configured, records are kept in memory only");
            Ok(Arc::new(MemorySink::new()))
        }
    }
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    let sink = open_sink(&config)?;
    let analyzer = Arc::new(HttpAnalyzer::new(&config.analyzer)?);
    let (pipeline, outcome_rx) = Pipeline::new(&config, analyzer, sink);
    let vehicle_id = cli.vehicle.unwrap_or_else(|| config.agent.vehicle_id.clone());

    if let Some(question) = cli.query {
        let saved = pipeline.query(&vehicle_id, &question).await?;
        println!("{}", serde_json::to_string_pretty(&saved.record)?);
        return Ok(());
    }

    if cli.comprehensive {
        let report = pipeline.comprehensive(&vehicle_id).await;
        for (kind, result) in [
            ("diagnostic", report.diagnostic),
            ("maintenance", report.maintenance),
            ("performance", report.performance),
        ] {
            match result {
                Ok(saved) => println!("{}", serde_json::to_string_pretty(&saved.record)?),
                Err(e) => error!(kind, error = %e, "Analysis failed"),
            }
        }
        return Ok(());
    }

    let path = config
        .ingest
        .path
        .as_deref()
        .context("ingest.path is required to ingest packets")?;
    let packets = ingest::load_packets(path).await?;

    // Report background analyses as they finish
    let reporter = tokio::spawn(report_outcomes(outcome_rx));

    let interval = std::time::Duration::from_millis(config.ingest.interval_ms);
    tokio::select! {
        result = pipeline.run(&packets, interval, config.ingest.cycle) => {
            result?;
            let stats = pipeline.stats();
            info!(
                packets = stats.packets_processed,
                anomalies = stats.anomalies,
                analyses = stats.analyses_dispatched,
                "Ingestion finished, waiting for in-flight analyses"
            );
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, exiting");
            return Ok(());
        }
    }

    // The reporter ends once every pipeline handle, including those held by
    // in-flight analyses, is gone.
    drop(pipeline);
    reporter.await.context("Outcome reporter panicked")?;

    Ok(())
}

async fn report_outcomes(mut rx: tokio::sync::mpsc::Receiver<AnalysisOutcome>) {
    while let Some(outcome) = rx.recv().await {
        match outcome.result {
            Ok(saved) => info!(
                vehicle_id = %outcome.vehicle_id,
                record_id = %saved.record_id,
                parsed = saved.record.record.parsed(),
                "Automatic analysis complete"
            ),
            Err(e) => error!(
                vehicle_id = %outcome.vehicle_id,
                error = %e,
                "Automatic analysis failed"
            ),
        }
    }
}
