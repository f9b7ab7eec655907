use std::sync::Arc;

use offload::config::Config;
use offload::store::{Database, LibSqlBackend};
use offload::worker::{ShellExecutor, WorkerRunner};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    let worker_id = std::env::var("OFFLOAD_WORKER_ID")
        .unwrap_or_else(|_| format!("worker-{}", Uuid::new_v4().simple()));

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {e}",
                    config.db_path.display()
                );
                std::process::exit(1);
            }),
    );

    let runner = WorkerRunner::new(db, Arc::new(ShellExecutor), worker_id, config);

    match std::env::var("OFFLOAD_TASK_ID") {
        // Supervisor-spawned: run exactly the assigned task, then exit.
        Ok(task_id) => {
            let task_id = Uuid::parse_str(&task_id).unwrap_or_else(|e| {
                eprintln!("Error: invalid OFFLOAD_TASK_ID: {e}");
                std::process::exit(1);
            });
            let status = runner.run_task(task_id).await?;
            tracing::info!(task_id = %task_id, status = %status, "Worker done");
        }
        // Standalone: claim and execute until killed.
        Err(_) => {
            runner.run_loop().await?;
        }
    }
    Ok(())
}
