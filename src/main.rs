use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use kube::Client;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gpu_device_operator::config::{LogFormat, OperatorArgs};
use gpu_device_operator::controller::{run_controller, ControllerState};
use gpu_device_operator::rest_api;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = OperatorArgs::parse();
    init_tracing(args.log_format);

    info!(
        "Starting gpu-device-operator {} (utils image {})",
        env!("CARGO_PKG_VERSION"),
        args.utils_image
    );

    let metrics_addr = args.metrics_socket()?;
    let retry = args.retry_policy()?;

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let state = Arc::new(ControllerState::new(client, args.utils_image.clone(), retry));

    tokio::spawn(async move {
        if let Err(e) = rest_api::run_server(metrics_addr).await {
            error!("Metrics server stopped: {}", e);
        }
    });

    run_controller(state).await?;
    info!("Controller shut down");
    Ok(())
}
