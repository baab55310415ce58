//! Courier CLI
//!
//! Drives the delivery core from the command line: inspect the effective
//! configuration, or run two parties against an in-process network and
//! watch a message travel through the delivery tiers.

use clap::{Parser, Subcommand};
use console::{style, Emoji};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, Level};

mod config;

use config::CliConfig;
use courier_delivery::prelude::*;

static LOCK: Emoji<'_, '_> = Emoji("🔐 ", "");
static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR] ");
static SEND: Emoji<'_, '_> = Emoji("📤 ", "[SEND] ");
static RECV: Emoji<'_, '_> = Emoji("📥 ", "[RECV] ");
static WAKE: Emoji<'_, '_> = Emoji("📶 ", "[NET] ");

/// Courier - peer-to-peer message delivery core
#[derive(Parser)]
#[command(name = "courier")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one message between two simulated parties
    Simulate {
        /// Message content
        #[arg(short, long, default_value = "hello from alice")]
        message: String,

        /// Start with the recipient offline
        #[arg(long)]
        bob_offline: bool,

        /// Recipient cannot take direct connections
        #[arg(long)]
        no_direct: bool,

        /// Make every attempt on this path fail (direct or relay)
        #[arg(long, value_name = "PATH")]
        fail: Vec<String>,
    },

    /// Show the effective configuration
    Config {
        /// Write the defaults to the config file
        #[arg(long)]
        reset: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(CliConfig::default_path);
    let config = CliConfig::load_or_default(&config_path)?;

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    courier_delivery::logging::init(log_level, config.json_logs)?;

    match cli.command {
        Commands::Simulate {
            message,
            bob_offline,
            no_direct,
            fail,
        } => {
            let failing = fail
                .iter()
                .map(|p| parse_path(p))
                .collect::<anyhow::Result<Vec<_>>>()?;
            simulate(&config, &message, bob_offline, no_direct, &failing).await?;
        }
        Commands::Config { reset } => {
            show_config(&config_path, config, reset)?;
        }
    }

    Ok(())
}

fn parse_path(name: &str) -> anyhow::Result<DeliveryPath> {
    match name {
        "direct" => Ok(DeliveryPath::Direct),
        "relay" => Ok(DeliveryPath::Relay),
        other => anyhow::bail!("unknown path '{}', expected direct or relay", other),
    }
}

fn status_label(status: DeliveryStatus) -> String {
    let label = format!("{:?}", status);
    match status {
        DeliveryStatus::Delivered => style(label).green().to_string(),
        DeliveryStatus::QueuedOffline => style(label).yellow().to_string(),
        DeliveryStatus::Failed => style(label).red().to_string(),
        _ => style(label).cyan().to_string(),
    }
}

async fn party(
    keystore: Arc<LocalKeystore>,
    network: &MemoryNetwork,
    config: &DeliveryConfig,
) -> anyhow::Result<MessageCoordinator> {
    let coordinator = MessageCoordinator::builder()
        .config(config.clone())
        .keystore(keystore)
        .network(Arc::new(network.clone()))
        .build()
        .await?;
    // Ends on its own once the coordinator is dropped
    coordinator.spawn_maintenance();
    Ok(coordinator)
}

async fn simulate(
    config: &CliConfig,
    message: &str,
    bob_offline: bool,
    no_direct: bool,
    failing: &[DeliveryPath],
) -> anyhow::Result<()> {
    // Throwaway identities; never touch the configured store
    let mut delivery = config.delivery.clone();
    delivery.storage.path = None;

    let alice_keys = Arc::new(LocalKeystore::generate(
        delivery.prekey_pool_size,
        delivery.prekey_refill_threshold,
    ));
    let bob_keys = Arc::new(LocalKeystore::generate(
        delivery.prekey_pool_size,
        delivery.prekey_refill_threshold,
    ));
    alice_keys.cache_prekey_bundle(bob_keys.issue_bundle())?;
    bob_keys.cache_prekey_bundle(alice_keys.issue_bundle())?;

    let network = MemoryNetwork::new();
    let alice = party(alice_keys, &network, &delivery).await?;
    let bob = party(bob_keys, &network, &delivery).await?;

    println!("{} Alice {}", LOCK, style(alice.own_id()).dim());
    println!("{} Bob   {}", LOCK, style(bob.own_id()).dim());
    for path in failing {
        network.fail_path(*path);
    }
    if !bob_offline {
        network.set_online(bob.own_id(), !no_direct);
    }

    let mut bob_events = bob.subscribe();
    let message_id = alice.send_text(bob.own_id(), message).await?;
    println!("{} Sending {}", SEND, style(message_id).cyan());

    let patience = delivery.direct_timeout() + delivery.relay_timeout() + Duration::from_secs(1);
    let mut last = watch(&alice, message_id, patience, true).await?;

    if last == DeliveryStatus::QueuedOffline {
        println!("{} Bob comes online", WAKE);
        let reachability = network.set_online(bob.own_id(), !no_direct);
        for path in failing {
            network.heal_path(*path);
        }
        let outcomes = bob.poll_stored().await?;
        debug!(?outcomes, "Bob polled the server");
        alice.on_reachability_changed(bob.own_id(), &reachability).await?;
        last = watch(&alice, message_id, patience, false).await?;
    }

    for raw in network.drain_inbox(bob.own_id()) {
        bob.on_incoming(&raw).await?;
    }

    let mut received = 0;
    while let Some(Some(event)) = futures::FutureExt::now_or_never(bob_events.next()) {
        if let DeliveryEvent::MessageReceived { body, .. } = event {
            received += 1;
            println!(
                "{} Bob received: {}",
                RECV,
                style(String::from_utf8_lossy(&body)).green()
            );
        }
    }

    if received == 1 && last == DeliveryStatus::Delivered {
        println!("{} Delivered exactly once", CHECK);
        Ok(())
    } else {
        println!(
            "{} Ended {} with {} copies received",
            CROSS,
            status_label(last),
            received
        );
        anyhow::bail!("simulation did not complete")
    }
}

/// Print status changes until the message settles
///
/// With `stop_when_queued`, reaching the offline queue counts as settled.
async fn watch(
    coordinator: &MessageCoordinator,
    message_id: MessageId,
    patience: Duration,
    stop_when_queued: bool,
) -> anyhow::Result<DeliveryStatus> {
    let mut updates = coordinator.on_status_changed(message_id).await?;
    let mut last = DeliveryStatus::Pending;
    while let Ok(Some(status)) = tokio::time::timeout(patience, updates.next()).await {
        let path = coordinator
            .envelope(message_id)
            .await?
            .and_then(|e| e.current_path)
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("   {} via {}", status_label(status), style(path).dim());
        last = status;
        if stop_when_queued && status == DeliveryStatus::QueuedOffline {
            break;
        }
    }
    Ok(last)
}

fn show_config(path: &std::path::Path, config: CliConfig, reset: bool) -> anyhow::Result<()> {
    let config = if reset {
        let defaults = CliConfig::default();
        defaults.save(path)?;
        println!("{} Wrote defaults to {}", CHECK, path.display());
        defaults
    } else {
        config
    };

    println!("{}", style(path.display()).dim());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
