//! scard-proxyd: the PC/SC proxy daemon.
//!
//! Takes the config path as its only (optional) argument. Log verbosity is
//! controlled through `RUST_LOG`.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::error;
use tracing_subscriber::EnvFilter;

use scard_proxy::pcsc::system::SystemBackend;
use scard_proxy::{ProxyConfig, Server};

#[cfg(unix)]
const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/scard-proxy.toml";
#[cfg(not(unix))]
const DEFAULT_CONFIG_PATH: &str = "scard-proxy.toml";

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    match run(&config_path).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn run(config_path: &str) -> scard_proxy::Result<()> {
    let config = ProxyConfig::from_file(config_path)?;
    config.validate_strict()?;

    let backend = Arc::new(SystemBackend::new());
    let server = Server::bind(&config, backend).await?;
    server.run().await
}
