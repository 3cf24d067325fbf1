//! Drains the outbound mail queue on a fixed tick.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use hp_actors::{MailWorker, WorkerConfig};
use hp_core::mail::SendmailTransport;
use hp_daemon::{logging, signal, Cli, Config};
use hp_db::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli).context("Failed to load configuration")?;
    logging::init(config.json_logs);

    let db = Database::connect(&config.database_path)
        .await
        .context("Failed to open database")?;
    db.migrate().await.context("Failed to run migrations")?;

    let worker = MailWorker::new(
        db,
        SendmailTransport::new(config.runner()),
        WorkerConfig {
            tick: Duration::from_secs(config.mail_worker_tick_secs),
            batch: config.mail_worker_batch,
            lease: Duration::from_secs(config.mail_worker_lease_secs),
        },
    );

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        signal::shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    info!(simulate = config.simulate, "Mail worker starting");
    worker.run(stop_rx).await;
    Ok(())
}
