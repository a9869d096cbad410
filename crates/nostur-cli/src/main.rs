use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nostur_cli::{
    build_collaborators, format_notification, format_stats, format_status, init_tracing, load_config, stats_json,
};
use nostur_core::{CoreEvent, CoreRuntime};
use tokio::sync::broadcast::error::RecvError;

#[derive(Parser)]
#[command(name = "nostur-cli")]
#[command(about = "Relay pool and follower notifications from the command line")]
struct Cli {
    /// Pretty-print JSON output
    #[arg(long, short)]
    pretty: bool,

    /// Debug logging to stderr (RUST_LOG takes precedence)
    #[arg(long, short)]
    verbose: bool,

    /// Path to JSON config file (relays, dataDir, lowDataMode, ...)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the configured relays and print their status and traffic
    Relays {
        /// Seconds to wait for connections before printing
        #[arg(long, default_value_t = 3)]
        wait: u64,
    },

    /// Look up an event locally, then on the relays
    FetchEvent {
        /// Event ID (hex)
        id: String,
        /// Relay to ask if the regular relays don't have it
        #[arg(long)]
        relay_hint: Option<String>,
    },

    /// Watch for new followers of an account until interrupted
    WatchFollowers {
        /// Account public key (hex)
        pubkey: String,
    },
}

fn print_json<T: serde::Serialize>(value: &T, pretty: bool) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", json);
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(cli.verbose) {
        eprintln!("Logging disabled: {:#}", e);
    }
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let file = load_config(cli.config.as_deref())?;
    let config = file.core_config();
    let collaborators = build_collaborators(&file, &config)?;
    tracing::info!("[CLI] data dir {}", config.data_dir.display());

    let mut runtime = CoreRuntime::new(config, collaborators).context("Failed to start core")?;
    let handle = runtime.handle();
    let result = match cli.command {
        Commands::Relays { wait } => {
            handle.connect_all()?;
            tokio::time::sleep(Duration::from_secs(wait)).await;
            let status = handle.relay_status().await?;
            let stats = runtime.stats().snapshot();
            if cli.pretty {
                print_json(&serde_json::json!({"relays": status, "stats": stats_json(&stats)}), true)
            } else {
                println!("{}\n\n{}", format_status(&status), format_stats(&stats));
                Ok(())
            }
        }
        Commands::FetchEvent { id, relay_hint } => {
            handle.connect_all()?;
            match handle.fetch_event(&id, relay_hint).await? {
                Some(event) => print_json(&event, cli.pretty),
                None => Err(anyhow::anyhow!("Event {} not found", id)),
            }
        }
        Commands::WatchFollowers { pubkey } => {
            let mut events = handle.subscribe();
            handle.set_active_account(Some(pubkey.clone()))?;
            handle.connect_all()?;
            handle.check_followers()?;
            eprintln!("Watching followers of {} (Ctrl-C to stop)", pubkey);
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break Ok(()),
                    received = events.recv() => match received {
                        Ok(CoreEvent::NotificationCreated(notification)) => {
                            if cli.pretty {
                                print_json(&notification, true)?;
                            } else {
                                println!("{}", format_notification(&notification));
                            }
                        }
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!("[CLI] skipped {} events", skipped);
                        }
                        Err(RecvError::Closed) => break Ok(()),
                    },
                }
            }
        }
    };

    tokio::task::spawn_blocking(move || runtime.shutdown())
        .await
        .context("Shutdown panicked")?;
    result
}
