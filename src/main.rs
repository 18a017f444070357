//! zai-gateway - HTTP Server Entry Point
//!
//! Starts the HTTP server that exposes the Anthropic-shaped proxy API.

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zai_gateway::{api, config::Config, error::GatewayError, log_ring::LogRing};

#[tokio::main]
async fn main() -> ExitCode {
    let log_ring = LogRing::new();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zai_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(log_ring.clone())
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            return ExitCode::from(1);
        }
    };
    info!(
        host = %config.host,
        port = config.port,
        keys = config.zai_api_keys.len(),
        "loaded configuration"
    );

    if let Err(e) = api::serve(config, log_ring).await {
        if e.downcast_ref::<GatewayError>()
            .is_some_and(|e| matches!(e, GatewayError::Bind(_)))
        {
            error!(error = %e, "failed to bind listener");
            return ExitCode::from(2);
        }
        error!(error = %e, "gateway exited with an error");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}
