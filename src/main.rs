//! CLI for railsub
//!
//! Subcommands:
//! - `server`: run the simulated fleet feed and the WebSocket server
//! - `token`: mint a bearer token for the notification feed
//! - `client`: connect to a feed and print events (useful for smoke tests)

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{error, info};

use railsub::broker::{Publisher, TopicRegistry};
use railsub::config::{DEFAULT_CONFIG_FILE, Settings, load_config_from};
use railsub::persistence::{SledNotificationStore, StaticTopology, Topology};
use railsub::simulation::{FleetSimulator, run_update_feed, start_simulation_loop};
use railsub::transport::{FeedServer, SubscriptionManager, TokenAuthority, start_websocket_server};
use railsub::utils::logging;
use railsub::utils::report::{ErrorSink, TracingErrorSink};

#[derive(Parser)]
#[command(name = "railsub", about = "Real-time train fleet feed")]
struct Cli {
    /// Configuration file, extension optional
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the WebSocket server
    Server,
    /// Print a token for the notification feed
    Token {
        #[arg(long)]
        user: u64,
    },
    /// Connect to a feed and print incoming events
    Client {
        /// Feed URL, e.g. ws://127.0.0.1:8080/ws/notificacoes/?token=...
        #[arg(long, default_value = "ws://127.0.0.1:8080/ws/trens/")]
        url: String,
        /// Line to subscribe to after connecting
        #[arg(long)]
        line: Option<String>,
        /// Stop after this many events
        #[arg(long, default_value_t = 10)]
        count: usize,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match load_config_from(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    let result = match cli.command {
        Command::Server => run_server(settings).await,
        Command::Token { user } => print_token(&settings, user),
        Command::Client { url, line, count } => run_client(&url, line.as_deref(), count).await,
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(SledNotificationStore::open(
        &settings.persistence.path,
        settings.persistence.retention(),
    )?);
    let topology: Arc<dyn Topology> = match &settings.persistence.topology_path {
        Some(path) => Arc::new(StaticTopology::from_json_file(path)?),
        None => Arc::new(StaticTopology::cptm()),
    };
    let errors: Arc<dyn ErrorSink> = Arc::new(TracingErrorSink);
    let registry = Arc::new(TopicRegistry::new());

    let publisher = Arc::new(
        Publisher::new(registry.clone(), store.clone(), errors.clone())
            .with_persist_timeout(settings.broker.persist_timeout()),
    );
    let manager = Arc::new(
        SubscriptionManager::new(registry, topology.clone(), store.clone())
            .with_queue_capacity(settings.broker.queue_capacity)
            .with_max_connections(settings.broker.max_connections),
    );
    let authority = Arc::new(
        TokenAuthority::new(settings.server.jwt_secret.clone())
            .with_ttl(settings.server.token_ttl()),
    );
    let server = Arc::new(
        FeedServer::new(manager, authority, errors)
            .with_write_timeout(settings.broker.write_timeout()),
    );

    if settings.persistence.retention().is_some() {
        tokio::spawn(SledNotificationStore::start_retention_loop(
            store,
            settings.persistence.sweep_interval(),
        ));
    }

    let (feed, updates) = mpsc::channel(settings.broker.feed_buffer.max(1));
    tokio::spawn(run_update_feed(updates, publisher));
    if settings.simulation.enabled {
        let simulator = FleetSimulator::from_topology(topology.as_ref(), &settings.simulation);
        tokio::spawn(start_simulation_loop(simulator, feed));
    } else {
        info!("Simulation disabled; no updates will be produced");
    }

    let listener = TcpListener::bind(settings.server.addr()).await?;

    tokio::select! {
        _ = start_websocket_server(listener, server) => {
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}

fn print_token(settings: &Settings, user: u64) -> Result<(), Box<dyn std::error::Error>> {
    let token = TokenAuthority::new(settings.server.jwt_secret.clone())
        .with_ttl(settings.server.token_ttl())
        .issue(user)?;
    println!("{token}");
    Ok(())
}

async fn run_client(
    url: &str,
    line: Option<&str>,
    count: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    let (mut ws_stream, _response) = connect_async(url).await?;
    info!("Connected to {url}");

    if let Some(line) = line {
        let subscribe = json!({ "type": "subscribe_linha", "linha_id": line });
        ws_stream
            .send(WsMessage::Text(subscribe.to_string().into()))
            .await?;
    }

    let mut received = 0;
    while received < count {
        match ws_stream.next().await {
            Some(Ok(WsMessage::Text(msg))) => {
                println!("{msg}");
                received += 1;
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }

    ws_stream.close(None).await?;
    Ok(())
}
