//! Scheduler binary: keeps the due-time index in Redis in step with the
//! endpoint table in Postgres and publishes probe messages to Kafka.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use downtime::index::{DueIndex, RedisScheduleStore};
use downtime::queue::kafka::KafkaWorkPublisher;
use downtime::scheduler::{SchedulerLoop, SystemClock};
use downtime::signal::cancel_on_shutdown_signal;
use downtime::store::PgConfigStore;
use downtime::Config;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "downtime-scheduler")]
#[command(about = "Dispatch due endpoint checks to the probe fleet")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logger::init_tracing();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if cli.print_config {
        println!("{config}");
        return Ok(());
    }

    let configs = PgConfigStore::connect(&config.postgres)
        .await
        .context("Failed to connect to the config store")?;
    let index_store = RedisScheduleStore::connect(&config.redis, &config.scheduler)
        .context("Failed to set up the due-time index")?;
    let publisher =
        KafkaWorkPublisher::new(&config.kafka).context("Failed to create the work queue producer")?;

    let index = DueIndex::new(Arc::new(configs), Arc::new(index_store), config.scheduler.sync_batch_size);
    let scheduler = SchedulerLoop::new(index, Arc::new(publisher), Arc::new(SystemClock), config.scheduler.clone());

    let shutdown = CancellationToken::new();
    cancel_on_shutdown_signal(shutdown.clone());

    info!(topic = %config.kafka.request_topic, "Scheduler running");
    scheduler.run(shutdown).await;

    info!("Scheduler shutdown complete");
    Ok(())
}
