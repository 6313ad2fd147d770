use clap::Parser;
use heartlink_road::{
    cli::{self, Cli, Commands},
    Config,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Default to WARN level if RUST_LOG is not set
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    if let Some(Commands::Probe { url, room, seconds }) = cli.command {
        if let Err(e) = cli::run_probe(url, room, seconds).await {
            error!("Probe error: {}", e);
            std::process::exit(1);
        }
        return;
    }

    let config = cli.apply(Config::from_env());
    info!("Starting HeartLink Road on {}", config.listen_addr());
    info!(
        "Heartbeat timeout: {}s (sweep every {}s)",
        config.heartbeat_timeout.as_secs(),
        config.heartbeat_sweep.as_secs()
    );

    let listener = match tokio::net::TcpListener::bind(config.listen_addr()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind {}: {}", config.listen_addr(), e);
            std::process::exit(1);
        }
    };

    if let Err(e) = heartlink_road::serve(listener, &config).await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
