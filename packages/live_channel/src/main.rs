use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use live_channel::{ChannelClient, ChannelConfig, ChannelFileConfig, ConnectionState, WILDCARD};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "channel-tail")]
#[command(about = "Tail or publish to a live event channel")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Full socket URL (overrides the config file)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Page origin to derive the socket URL from, e.g. https://dash.example.com
    #[arg(long, global = true)]
    origin: Option<String>,

    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print incoming envelopes as JSON lines until interrupted
    Watch(WatchArgs),

    /// Publish a single event and exit
    Send(SendArgs),
}

#[derive(Parser)]
struct WatchArgs {
    /// Only print these events (repeatable; default: everything)
    #[arg(long = "event")]
    events: Vec<String>,
}

#[derive(Parser)]
struct SendArgs {
    /// Event name
    event: String,

    /// JSON payload (default: null)
    data: Option<String>,

    /// How long to wait for the connection
    #[arg(long, default_value = "10")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("live_channel=info,channel_tail=info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    let mut file_config: ChannelFileConfig = live_channel::load_config(cli.config.as_deref())
        .extract()
        .context("failed to load channel config")?;
    match (cli.url, cli.origin) {
        (Some(url), _) => file_config.url = Some(url),
        // --origin on the command line beats a url from the file.
        (None, Some(origin)) => {
            file_config.url = None;
            file_config.origin = Some(origin);
        }
        (None, None) => {}
    }
    let config = ChannelConfig::from_file(&file_config)?;
    info!(url = %config.url, "channel target");

    let client = ChannelClient::new(config)?;
    let result = match cli.command {
        Commands::Watch(args) => watch(&client, args).await,
        Commands::Send(args) => send(&client, args).await,
    };
    shutdown(&client).await;
    result
}

/// Destroy the client and give the driver a moment to finish the close handshake.
async fn shutdown(client: &ChannelClient) {
    let mut state = client.state_watch();
    client.destroy();
    let drained = tokio::time::timeout(Duration::from_secs(3), async {
        while state.changed().await.is_ok() {}
    })
    .await;
    if drained.is_err() {
        warn!("channel did not shut down cleanly");
    }
}

async fn watch(client: &ChannelClient, args: WatchArgs) -> Result<()> {
    let print = |envelope: &Value| match serde_json::to_string(envelope) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "failed to print envelope"),
    };

    if args.events.is_empty() {
        client.on(WILDCARD, print);
    } else {
        for event in args.events {
            let name = event.clone();
            client.on(&event, move |data| {
                print(&serde_json::json!({ "event": name, "data": data }));
            });
        }
    }
    client.on_state_change(|state| info!(%state, "channel state"));

    client.connect();
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("interrupted; closing channel");
    Ok(())
}

async fn send(client: &ChannelClient, args: SendArgs) -> Result<()> {
    let data: Value = match args.data.as_deref() {
        Some(raw) => serde_json::from_str(raw).context("payload is not valid JSON")?,
        None => Value::Null,
    };

    client.connect();
    let timeout = Duration::from_secs(args.timeout_secs);
    if !client
        .wait_for_state(ConnectionState::Connected, timeout)
        .await
    {
        bail!("channel did not connect within {}s", args.timeout_secs);
    }
    if !client.send(&args.event, &data) {
        bail!("channel dropped before '{}' could be sent", args.event);
    }
    info!(event = %args.event, "sent");
    Ok(())
}
