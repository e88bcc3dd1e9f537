//! Command-line entry point for the postbox delivery engine
//!
//! Subcommands:
//! - `serve`: run the periodic dispatch loop until interrupted
//! - `dispatch`: run exactly one dispatch cycle and print the counts
//! - `locks`: inspect or force-clear dispatch lock leases

use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use postbox::{Config, Service};
use postbox_common::{Signal, logging};
use postbox_delivery::{
    DispatchRunner, Dispatcher, LoopbackTransport, SimpleTemplateEngine, TransportRegistry,
};
use postbox_lock::DistributedLock;
use postbox_store::{
    LeaseStore, MemoryLeaseStore, MemoryMessageStore, MessageStore, OwnerToken,
};

/// Queueing and delivery engine for outbound mail
#[derive(Parser, Debug)]
#[command(name = "postbox")]
#[command(about = "Run the postbox mail delivery engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the toml configuration file
    #[arg(short, long, default_value = "./postbox.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the periodic dispatch loop until interrupted
    Serve,
    /// Run one dispatch cycle and exit
    Dispatch,
    /// Lock lease inspection and cleanup
    Locks {
        #[command(subcommand)]
        action: LockAction,
    },
}

#[derive(Subcommand, Debug)]
enum LockAction {
    /// List all stored lock leases
    List,
    /// Forcibly remove a lease regardless of owner
    Clear {
        /// Name of the lock to clear
        name: String,
    },
}

fn load_config(path: &PathBuf) -> anyhow::Result<Config> {
    if path.exists() {
        Ok(Config::from_file(path)?)
    } else {
        Ok(Config::default())
    }
}

struct Engine {
    service: Service,
    lock: DistributedLock,
}

fn build_engine(config: &Config) -> anyhow::Result<Engine> {
    let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&store),
        Arc::new(SimpleTemplateEngine::new()),
        config.retry.clone(),
        config.log_level,
    ));

    let mut transports = TransportRegistry::new();
    transports.register("default", Arc::new(LoopbackTransport::new()));

    let leases: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
    let lock = DistributedLock::new(leases, OwnerToken::generate(), config.lock.timeout())?;

    let runner = Arc::new(DispatchRunner::new(
        store,
        dispatcher,
        Arc::new(transports),
        lock.clone(),
    ));

    Ok(Engine {
        service: Service::new(runner, lock.clone(), config.dispatch.clone()),
        lock,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let engine = build_engine(&config)?;

    match cli.command {
        Commands::Serve => {
            let (sender, receiver) = tokio::sync::broadcast::channel(1);

            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    sender.send(Signal::Shutdown).ok();
                }
            });

            engine.service.serve(receiver).await;
        }
        Commands::Dispatch => {
            let counts = engine.service.run_once().await?;
            println!(
                "sent: {}, failed: {}, requeued: {}",
                counts.sent, counts.failed, counts.requeued
            );
        }
        Commands::Locks { action } => match action {
            LockAction::List => {
                let leases = engine.lock.leases();
                if leases.is_empty() {
                    println!("no lock leases");
                }
                for lease in leases {
                    println!(
                        "{}\towner={}\texpires_at={}",
                        lease.name, lease.owner, lease.expires_at
                    );
                }
            }
            LockAction::Clear { name } => {
                if engine.lock.force_clear(&name) {
                    println!("cleared lock '{name}'");
                } else {
                    println!("no lease stored for '{name}'");
                }
            }
        },
    }

    Ok(())
}
