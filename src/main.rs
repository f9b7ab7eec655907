use std::sync::Arc;

use offload::config::Config;
use offload::notify::{Notifier, WebhookNotifier};
use offload::orchestrator::{DelegatingHandler, MessageHandler, ProcessLauncher, Supervisor};
use offload::queue::Producer;
use offload::store::{Database, LibSqlBackend};

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

    // `offloadd status`: print the operational snapshot and exit
    if std::env::args().nth(1).as_deref() == Some("status") {
        let stats = db.queue_stats().await?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    eprintln!("offloadd v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Worker bin: {}", config.worker_bin.display());
    eprintln!(
        "   Poll: {:?}  Cap: {}  Claim timeout: {:?}",
        config.poll_interval, config.max_workers, config.claim_timeout
    );

    let launcher = Arc::new(ProcessLauncher::new(
        config.worker_bin.clone(),
        config.db_path.clone(),
    ));
    let notifier: Arc<dyn Notifier> = Arc::new(WebhookNotifier::new());
    let handler: Arc<dyn MessageHandler> = Arc::new(DelegatingHandler::new(
        Producer::new(Arc::clone(&db)),
        config.default_max_retries,
    ));

    let supervisor =
        Supervisor::new(config, db, launcher, notifier).with_message_handler(handler);
    supervisor.run().await;
    Ok(())
}
