use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use api_gateway::{build_state, Config, GatewayServer};

#[derive(Parser, Debug)]
#[command(name = "api-gateway")]
#[command(about = "HTTP/WebSocket API gateway with load balancing and circuit breaking")]
struct Args {
    /// Override ROUTES_CONFIG_PATH.
    #[arg(short, long)]
    routes: Option<String>,

    /// Load and validate the configuration, then exit.
    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is not an error.
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = Config::from_env().map_err(|e| {
        // Tracing is not initialized yet; this must still reach the operator.
        eprintln!("configuration error: {}", e);
        e
    })?;
    if let Some(routes_path) = args.routes {
        config.routes_config_path = routes_path;
    }

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let routes = config.load_routes()?;

    if args.validate_config {
        info!("configuration is valid");
        return Ok(());
    }

    info!(
        port = config.port,
        backends = config.backends.len(),
        routes = routes.len(),
        "starting api gateway"
    );

    let state = build_state(config)?;
    GatewayServer::new(state, routes).run().await?;

    Ok(())
}
