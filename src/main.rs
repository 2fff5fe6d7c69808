use anyhow::Result;
use chorus_core::{api::ApiServer, config::Config, system::System};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chorus-core", about = "Multi-agent orchestration engine")]
struct Args {
    /// Override the API bind host
    #[arg(long)]
    host: Option<String>,
    /// Override the API bind port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::load()?;
    if let Some(host) = args.host {
        config.api.host = host;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }

    info!("Starting Chorus Core orchestration engine");
    let system = System::assemble(config.clone()).await?;
    system.spawn_scheduler();

    let api_server = ApiServer::new(&config, &system);

    tokio::select! {
        result = api_server.run() => {
            if let Err(e) = result {
                tracing::error!("API server failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
