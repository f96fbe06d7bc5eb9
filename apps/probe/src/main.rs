//! Probe binary: consumes probe messages from Kafka, measures each target
//! and publishes result records before committing.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use downtime::model::ProbeIdentity;
use downtime::probe::{ConnectionManager, ConnectionSettings, EngineSettings, MeasurementEngine};
use downtime::queue::kafka::KafkaWorkConsumer;
use downtime::signal::cancel_on_shutdown_signal;
use downtime::sink::{JsonLinesSink, KafkaResultSink, ResultSink, TeeSink};
use downtime::worker::{WorkerPool, WorkerSettings};
use downtime::Config;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "downtime-probe")]
#[command(about = "Measure endpoints handed out by the scheduler")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Region label stamped on every result, overriding the config
    #[arg(short, long)]
    region: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

async fn result_sink(config: &Config) -> anyhow::Result<Arc<dyn ResultSink>> {
    let log: Arc<dyn ResultSink> = match &config.sink.log_file {
        Some(path) => Arc::new(
            JsonLinesSink::append_to(path)
                .await
                .with_context(|| format!("Failed to open result log {}", path.display()))?,
        ),
        None => Arc::new(JsonLinesSink::stdout()),
    };

    if !config.sink.publish_to_broker {
        return Ok(log);
    }
    let broker = KafkaResultSink::new(&config.kafka).context("Failed to create the result producer")?;
    Ok(Arc::new(TeeSink::new(vec![Arc::new(broker), log])))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logger::init_tracing();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if let Some(region) = cli.region {
        config.probe.region = region;
    }
    if cli.print_config {
        println!("{config}");
        return Ok(());
    }

    let connections = Arc::new(ConnectionManager::new(ConnectionSettings::from(&config.probe))?);
    let engine = Arc::new(MeasurementEngine::new(connections, EngineSettings::from(&config.probe)));
    let consumer = KafkaWorkConsumer::subscribe(&config.kafka).context("Failed to join the consumer group")?;
    let sink = result_sink(&config).await?;
    let identity = ProbeIdentity { probe_id: config.probe.probe_id.clone(), region: config.probe.region.clone() };

    let pool = WorkerPool::new(Arc::new(consumer), engine, sink, identity, WorkerSettings::from(&config.probe))?;

    let shutdown = CancellationToken::new();
    cancel_on_shutdown_signal(shutdown.clone());

    info!(
        region = %config.probe.region,
        topic = %config.kafka.request_topic,
        group = %config.kafka.group_id,
        "Probe running"
    );

    match pool.run(shutdown).await {
        Ok(report) => {
            info!(received = report.received, uncommitted = report.uncommitted, "Probe shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Probe stopped: {e}");
            Err(e.into())
        }
    }
}
