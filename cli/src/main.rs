// relayctl — command-line front end for circuit relay
//
// Runs the reference relay server, or a client session that connects to
// relays, optionally opens a route and prints service events.

mod config;

use anyhow::{Context, Result};
use circuit_relay_core::{
    CircuitRelayConfig, CircuitRelayEvent, RelayServer, RelayServerConfig, RelayService,
    TcpRelayTransport,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "relayctl")]
#[command(about = "Circuit relay server and client", long_about = None)]
#[command(version)]
struct Cli {
    /// Verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a relay server
    Serve {
        #[arg(short, long, default_value = "0.0.0.0:4001")]
        listen: String,
        #[arg(long)]
        max_routes: Option<usize>,
        #[arg(long)]
        peer_id: Option<String>,
    },
    /// Connect to relays and print events until Ctrl-C
    Connect {
        /// Relay address, may be repeated
        #[arg(short, long = "relay")]
        relays: Vec<String>,
        #[arg(long)]
        peer_id: Option<String>,
        /// Open a route to this peer
        #[arg(short, long)]
        target: Option<String>,
        /// Send one message on the route
        #[arg(short, long, requires = "target")]
        message: Option<String>,
        /// Signal channel endpoint (ws:// or wss://)
        #[arg(short, long)]
        signal: Option<String>,
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Inspect or create the config file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    Init {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve {
            listen,
            max_routes,
            peer_id,
        } => cmd_serve(listen, max_routes, peer_id).await,
        Commands::Connect {
            relays,
            peer_id,
            target,
            message,
            signal,
            config,
        } => {
            let mut cfg = config::load(config.as_deref())?;
            if !relays.is_empty() {
                cfg.relays = relays;
            }
            if let Some(id) = peer_id {
                cfg.local_peer_id = id;
            }
            if let Some(endpoint) = signal {
                cfg.signal_endpoint = Some(endpoint);
            }
            cmd_connect(cfg, target, message).await
        }
        Commands::Config { action } => cmd_config(action),
    }
}

async fn cmd_serve(listen: String, max_routes: Option<usize>, peer_id: Option<String>) -> Result<()> {
    let mut server_config = RelayServerConfig::default();
    if let Some(max) = max_routes {
        server_config.max_routes = max;
    }
    if let Some(id) = peer_id {
        server_config.relay_peer_id = id;
    }

    let server = Arc::new(RelayServer::with_config(server_config));
    let (addr, handle) = Arc::clone(&server)
        .bind(&listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;

    println!("{}", "Relay server running".bold());
    println!("  Peer ID: {}", server.relay_peer_id().bright_cyan());
    println!("  Address: {}", format!("tcp://{}", addr).bright_yellow());
    println!();
    println!("Press Ctrl-C to stop.");

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let stats = server.get_stats();
                println!(
                    "{} peers={} routes={} frames={} bytes={}",
                    "stats".dimmed(),
                    stats.connections_active,
                    stats.routes_active,
                    stats.frames_forwarded,
                    stats.bytes_relayed
                );
            }
        }
    }

    handle.abort();
    println!("{}", "Relay server stopped".bold());
    Ok(())
}

async fn cmd_connect(
    config: CircuitRelayConfig,
    target: Option<String>,
    message: Option<String>,
) -> Result<()> {
    if config.relays.is_empty() && config.signal_endpoint.is_none() {
        anyhow::bail!("No relays configured; pass --relay ADDR or add relays to the config file");
    }

    let peer_id = config.local_peer_id.clone();
    let service = RelayService::new(config, Arc::new(TcpRelayTransport::new()))
        .context("Failed to create relay service")?;
    let mut events = service.subscribe();
    service.start().await;

    println!("{}", "Relay client started".bold());
    println!("  Peer ID: {}", peer_id.bright_cyan());
    for relay in service.get_all_relays() {
        let state = if relay.is_connected {
            "connected".green()
        } else {
            "not connected".red()
        };
        println!("  Relay:   {} ({}, {})", relay.address, relay.relay_type, state);
    }
    println!();

    let mut inbox = None;
    if let Some(target) = target {
        let route_id = service
            .create_route(&target)
            .await
            .with_context(|| format!("Failed to open route to {}", target))?;
        println!("{} Route {} to {}", "✓".green(), route_id, target.bright_cyan());

        if let Some(text) = message {
            if service
                .send_message_through_route(&route_id, text.as_bytes())
                .await
            {
                println!("{} Sent {} bytes", "✓".green(), text.len());
            } else {
                println!("{} Send failed", "✗".red());
            }
        }
        inbox = service.subscribe_route(&route_id);
    }

    println!("Listening for events, Ctrl-C to quit.");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&event);
                // Follow inbound routes so their payloads are printed too.
                if let CircuitRelayEvent::RouteEstablished { route_id, .. } = &event {
                    if inbox.is_none() {
                        inbox = service.subscribe_route(route_id);
                    }
                }
            }
            payload = recv_payload(&mut inbox) => {
                match payload {
                    Some(bytes) => println!(
                        "{} {}",
                        "←".bright_green(),
                        String::from_utf8_lossy(&bytes)
                    ),
                    None => inbox = None,
                }
            }
        }
    }

    service.stop().await;
    let status = service.status();
    println!();
    println!(
        "{}",
        serde_json::to_string_pretty(&status).context("Failed to serialize status")?
    );
    Ok(())
}

async fn recv_payload(
    inbox: &mut Option<tokio::sync::mpsc::UnboundedReceiver<Vec<u8>>>,
) -> Option<Vec<u8>> {
    match inbox {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn print_event(event: &CircuitRelayEvent) {
    let label = match event {
        CircuitRelayEvent::Error { .. } => event.event_type().red(),
        CircuitRelayEvent::RelayDisconnected { .. } | CircuitRelayEvent::RouteClosed { .. } => {
            event.event_type().yellow()
        }
        _ => event.event_type().green(),
    };
    println!("{} {}", label, event);
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { config: path } => {
            let cfg = config::load(path.as_deref())?;
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config::list(&cfg) {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
            println!();
            println!("{}", "Seed relays:".bold());
            if cfg.relays.is_empty() {
                println!("  {}", "(none configured)".dimmed());
            } else {
                for (i, relay) in cfg.relays.iter().enumerate() {
                    println!("  {}. {}", i + 1, relay);
                }
            }
        }
        ConfigAction::Init {
            config: path,
            force,
        } => {
            let path = match path {
                Some(p) => p,
                None => config::default_config_file()?,
            };
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                );
            }
            config::save_to(&CircuitRelayConfig::default(), &path)?;
            println!("{} Wrote {}", "✓".green(), path.display());
        }
    }
    Ok(())
}
