//! Tale gateway: HTTP front for story generation, moment verification and circuit control.

mod app;
mod review;

use std::sync::Arc;
use tale_core::{OpenRouterProvider, TaleConfig, TaleError};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_BIND: &str = "127.0.0.1:8000";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = TaleConfig::load()?;
    if std::env::args().any(|a| a == "--print-config") {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let api_key = OpenRouterProvider::api_key_from_env().ok_or_else(|| {
        TaleError::Config("set TALE_API_KEY or OPENROUTER_API_KEY".into())
    })?;
    let provider = Arc::new(OpenRouterProvider::new(api_key, config.provider.clone())?);
    let state = Arc::new(app::AppState::build(&config, provider)?);

    let bind = std::env::var("TALE_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(
        target: "tale::finops",
        %bind,
        token_budget = config.guard.token_budget_per_session,
        cost_threshold_usd = config.guard.cost_threshold_usd,
        "gateway listening"
    );

    axum::serve(listener, app::router(state)).await?;
    Ok(())
}
