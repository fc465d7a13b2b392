use clap::Parser;
use relay_gateway::config::describe_search_paths;
use relay_gateway::{build_router, AppState, GatewayConfig, Relay, SharedLogger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "relay-gateway",
    about = "One OpenAI-compatible API in front of OpenAI, Claude and Gemini channels",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// JSONL event and usage log
    #[arg(long, default_value = "relay-gateway.log")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in describe_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path);
        }
        return Ok(());
    }

    let mut config = GatewayConfig::find_and_load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }
    config.validate()?;

    let logger = SharedLogger::new(&cli.log_file)?;

    info!("relay-gateway v{}", env!("CARGO_PKG_VERSION"));
    for channel in &config.channels {
        info!(
            "  Channel {:<16} provider={:<18} base_url={} models={}",
            channel.name,
            channel.provider,
            channel.effective_base_url()?,
            if channel.models.is_empty() {
                "*".to_string()
            } else {
                channel.models.join(",")
            }
        );
    }
    info!("  Retries:   {}", config.retry_times);
    info!("  Log file:  {}", cli.log_file.display());

    logger.info(
        "startup",
        format!(
            "Starting relay-gateway channels={} port={}",
            config.channels.len(),
            config.port
        ),
    );

    let state = Arc::new(AppState {
        relay: Arc::new(Relay::new(&config, logger.clone())),
        logger,
    });

    let app = build_router(state);
    let bind_addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
