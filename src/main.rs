use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use newsroom::{
    AppState,
    api::routes::create_router,
    config::Config,
    generator::BatchGenerator,
    llm::OllamaClient,
    logging::init_logging,
    scheduler::Scheduler,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    // Configuration errors are fatal
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return Err(e.into());
        }
    };
    let server_addr = config.server_addr;
    info!(
        sections = config.news.sections.len(),
        public_dir = %config.public_dir.display(),
        model = %config.news.ollama_config.model,
        "configuration loaded"
    );

    let client = OllamaClient::new(&config.news.ollama_config)?;
    let batch = BatchGenerator::new(Arc::new(client), config.news.clone(), config.public_dir.clone());
    let (scheduler, handle) = Scheduler::new(config.news.schedule_policy(), Arc::new(batch));

    let shutdown = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    let app_state = AppState {
        config: Arc::new(config),
        scheduler: handle,
    };
    let app = create_router(app_state);

    let listener = TcpListener::bind(server_addr).await?;
    info!("Listening on {}", server_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    scheduler_task.await?;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
