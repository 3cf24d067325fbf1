use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};

use hp_actors::TaskRegistry;
use hp_daemon::config::generate_config_template;
use hp_daemon::{build_router, logging, signal, AppState, Cli, Config, JwtKeys};
use hp_db::Database;
use hp_services::HostContext;

const TASK_PRUNE_INTERVAL: Duration = Duration::from_secs(600);

/// Drop finished tasks an hour after they end so the table stays small.
fn spawn_task_pruner(tasks: TaskRegistry) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TASK_PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            let pruned = tasks.prune_finished(chrono::Duration::hours(1));
            if pruned > 0 {
                debug!(pruned, "Pruned finished tasks");
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    if cli.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    let config = Config::load(&cli).context("Failed to load configuration")?;
    logging::init(config.json_logs);
    let config = config.finalize().context("Invalid configuration")?;
    let addr = config.bind_addr()?;

    info!(
        simulate = config.simulate,
        web_server = %config.web_server,
        database = %config.database_path.display(),
        "hostpanel starting"
    );

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let db = Database::connect(&config.database_path)
        .await
        .context("Failed to open database")?;
    db.migrate().await.context("Failed to run migrations")?;

    let host = HostContext::new(config.runner(), config.host_paths(), config.host_settings());
    let jwt = JwtKeys::new(
        config.jwt_secret.as_bytes().to_vec(),
        Duration::from_secs(config.token_ttl_secs),
    );
    let state = AppState::new(db, host, jwt);
    spawn_task_pruner(state.tasks.clone());
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(signal::shutdown_signal())
        .await
        .context("HTTP server error")?;

    info!("hostpanel stopped");
    Ok(())
}
