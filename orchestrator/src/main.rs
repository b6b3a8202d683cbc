use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use orchestrator::config::{Config, LogFormat};
use orchestrator::{api, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "orchestrator=debug,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    info!(
        port = config.port,
        workdir = %config.workdir.display(),
        task_timeout_secs = config.task_timeout.as_secs_f64(),
        max_sessions = config.max_sessions,
        allow_network = config.allow_network,
        allow_file_io = config.allow_file_io,
        "orchestrator starting"
    );

    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(config).await?;
    let app = api::router(state.clone());

    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    state.shutdown();
    Ok(())
}
