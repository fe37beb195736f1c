use std::{net::SocketAddr, process::ExitCode};

use tagbridge_app::{AppState, build_router, config::AppConfig};
use tagbridge_observability::init_observability;
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let _observability = init_observability("tagbridge-app");

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            error!(event = "app.exit", error = %message);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), String> {
    let config = AppConfig::from_env().map_err(|err| err.to_string())?;
    let state = AppState::from_config(&config).map_err(|err| err.to_string())?;
    let app = build_router(state);
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|err| format!("invalid listen address {}:{}: {err}", config.host, config.port))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| format!("failed to bind {addr}: {err}"))?;
    info!(event = "app.listening", addr = %addr);
    axum::serve(listener, app).await.map_err(|err| format!("server failed: {err}"))
}
