use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use chat_relay::api::App;
use chat_relay::bus::{Bus, MemoryBus, RedisBus};
use chat_relay::config::{self, BusBackend, Config};
use chat_relay::store::{self, PgChannelStore, PgSubscriberStore};
use chat_relay::workers::WorkerSupervisor;

#[derive(Parser)]
#[command(name = "chat-relay")]
#[command(author = "Krakaw")]
#[command(version = "1.0.0")]
#[command(about = "Multi-node WebSocket chat relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay node (default)
    Serve,

    /// Create the database schema and exit
    SetupDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = match config::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {}", err);
            std::process::exit(-1);
        }
    };

    chat_relay::logging::init(&config.log)?;

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::SetupDb => setup_db(&config).await,
    }
}

async fn setup_db(config: &Config) -> Result<()> {
    let client = match store::connect(&config.database).await {
        Ok(client) => client,
        Err(err) => {
            error!("Get DB connection failed: {}", err);
            std::process::exit(-1);
        }
    };

    if let Err(err) = store::setup_schema(&client).await {
        error!("Create tables failed: {}", err);
        std::process::exit(-2);
    }

    info!("Create tables success!");
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    info!("Starting server...");
    info!("Start persistence services...");

    let client = match store::connect(&config.database).await {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!("Error connecting to database: {}", err);
            std::process::exit(-1);
        }
    };
    let channel_store = Arc::new(PgChannelStore::new(client.clone()));
    let subscriber_store = Arc::new(PgSubscriberStore::new(client));

    info!("Start transport services...");

    let bus: Arc<dyn Bus> = match config.pubsub.backend {
        BusBackend::Memory => Arc::new(MemoryBus::new()),
        BusBackend::Redis => match RedisBus::connect(&config.pubsub.redis_url()).await {
            Ok(bus) => Arc::new(bus),
            Err(err) => {
                error!("Error connecting to Redis: {}", err);
                std::process::exit(-1);
            }
        },
    };

    info!("Starting chat server...");
    let app = App::bind(config, bus, channel_store, subscriber_store).await?;

    tokio::signal::ctrl_c().await?;
    info!("Received interrupt signal. Shutting down...");

    // Stop the relay graph, wait, and complete ongoing tasks.
    app.shutdown().await;

    info!("Waiting on services to complete tasks...");
    WorkerSupervisor::instance().wait_all().await;

    info!("All tasks completed.");
    info!("Server stopped! goodbye.");
    Ok(())
}
