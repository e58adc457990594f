use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::info;

use courtbook::api::{self, AppState, Broadcast};
use courtbook::auth::GatewayAuth;
use courtbook::config::Config;
use courtbook::engine::Engine;
use courtbook::notify::NotifyHub;
use courtbook::scheduler;
use courtbook::telegram::{MessageSender, TelegramClient};

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    courtbook::observability::init(config.metrics_port)?;
    std::fs::create_dir_all(&config.data_dir)?;

    let hub = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(config.wal_path(), hub.clone(), config.policy())?);

    let compactor = engine.clone();
    let threshold = config.compact_threshold;
    tokio::spawn(async move {
        scheduler::run_compactor(compactor, threshold).await;
    });

    let broadcast = config.telegram.as_ref().map(|tg| Broadcast {
        sender: Arc::new(TelegramClient::new(tg.token.clone())) as Arc<dyn MessageSender>,
        chat_id: tg.chat_id.clone(),
    });
    if let Some(b) = broadcast.clone() {
        let engine = engine.clone();
        let at = config.broadcast_at;
        tokio::spawn(async move {
            scheduler::run_daily_broadcast(engine, b.sender, b.chat_id, at).await;
        });
    }

    let state = AppState {
        engine,
        hub,
        auth: Arc::new(GatewayAuth::new(config.api_token.clone())),
        broadcast,
    };

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("courtbook listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!(
        "  business hours: {}-{}",
        config.open_time.format("%H:%M"),
        config.close_time.format("%H:%M")
    );
    info!("  api token: {}", if config.api_token.is_some() { "required" } else { "not required" });
    info!("  telegram: {}", if config.telegram.is_some() { "enabled" } else { "disabled" });
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("courtbook stopped");
    Ok(())
}
