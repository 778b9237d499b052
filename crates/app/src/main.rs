mod admin;
mod problem;
mod queue;
mod router;
mod scheduler;
mod tap;
mod tasks;
mod telemetry;

use std::net::SocketAddr;

use tracing::info;

use mailcheck_storage::Database;
use mailcheck_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", url = %config.database_url, "database ready");

    let tap_hub = tap::TapHub::new();
    let (job_queue, job_receiver) =
        queue::JobQueue::new(config.job_queue_capacity, tap_hub.clone());
    queue::JobWorker::new(
        job_receiver,
        tasks::TaskRunner::new(database.clone()),
        tap_hub.clone(),
        config.job_workers,
    )
    .spawn();

    if let Some(schedule) = config.heartbeat.clone() {
        scheduler::HeartbeatScheduler::new(job_queue.clone(), tap_hub.clone(), schedule).spawn();
    }

    let state = router::AppState::new(metrics, tap_hub, database, job_queue)
        .with_homepage_populate_count(config.homepage_populate_count);

    let addr: SocketAddr = config.bind_addr;
    info!(
        stage = "app",
        %addr,
        env = %config.environment.as_str(),
        workers = config.job_workers,
        "starting HTTP server"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router::app_router(state))
        .await
        .map_err(|err| err.into())
}
