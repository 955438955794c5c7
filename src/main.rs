use tokio_util::sync::CancellationToken;

mod app;
mod backend;
mod config;
mod dishes;
mod error;
mod images;
mod state;
mod storage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "menuboard=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let shutdown = CancellationToken::new();
    let app_state = state::AppState::init(shutdown.clone()).await?;
    tracing::info!(app = %app_state.backend.name(), "app state ready");

    if let Some(pool) = app_state.backend.pg_pool() {
        if let Err(e) = sqlx::migrate!("./migrations").run(pool).await {
            tracing::warn!(error = %e, "migrations folder not found or migration failed; continuing");
        }
    }

    let app = app::build_app(app_state);
    app::serve(app, shutdown).await
}
