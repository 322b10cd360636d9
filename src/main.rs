use storage_dashboard::app;
use storage_dashboard::config::Config;

/// Main entry point for the dashboard server
///
/// Reads the configuration from the environment and serves the dashboard
/// until the process is stopped. Log output follows `RUST_LOG` and defaults
/// to `info`.
///
/// # Returns
/// * `Result<(), Box<dyn std::error::Error>>` - Success or error object
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;
    app::run(config).await
}
