use axum::{routing::get, Router};
use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{trace::TraceLayer, cors::{Any, CorsLayer}};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod db;
mod error;
mod launch;
mod models;
mod oauth;
mod outcomes;
mod params;
mod routes;
mod seed;
mod tool_client;

#[cfg(test)]
mod test_support;

use config::HarnessConfig;
use routes::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "lti_harness=info,tower_http=info".into())
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = HarnessConfig::from_env()?;
    let store = db::connect(&config).await?;
    if config.seed_demo_data {
        seed::seed_demo_data(store.as_ref()).await?;
    }

    let port = config.port;
    tracing::info!(public_url = %config.public_url, outcomes_url = %config.outcomes_url(), "consumer configured");
    let state = AppState {
        db: store,
        config: Arc::new(config),
        http: reqwest::Client::new(),
    };

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(routes::router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on http://0.0.0.0:{}", port);

    axum::serve(listener, app).await?;
    Ok(())
}
