//! Qanban Node
//!
//! Keeps one party's replica of its contracts and syncs it through a relay.
//! Commands are read from stdin, one JSON object per line:
//!
//! ```text
//! {"type":"propose","description":"Bake a cake","assignee":"Bob","reviewers":["Alice"]}
//! {"type":"accept","id":"Alice-..."}
//! list
//! ```
//!
//! Every committed transition is printed to stdout as
//! `{"id": .., "contract": ..}`.
//!
//! Usage:
//!   qanban-node --name Alice [--relay ws://localhost:7475] [--database alice.db] [--clean]

use anyhow::{bail, Context};
use clap::Parser;
use qanban::protocol::{self, Command, ErrorFrame};
use qanban::{Contract, ContractId, Ledger, PartyId, RelayClient, Replica, SqliteLedger};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Qanban Node
#[derive(Parser)]
#[command(name = "qanban-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Party name to log in as
    #[arg(short, long, env = "QANBAN_NAME")]
    name: PartyId,

    /// Relay URL, including the namespace path if any
    #[arg(short, long, env = "QANBAN_RELAY", default_value = "ws://localhost:7475")]
    relay: String,

    /// Ledger database (default: <config dir>/qanban/<name>.db)
    #[arg(short, long, env = "QANBAN_DATABASE")]
    database: Option<PathBuf>,

    /// Delete the database before starting
    #[arg(long)]
    clean: bool,
}

fn database_path(args: &Args) -> anyhow::Result<PathBuf> {
    if let Some(path) = &args.database {
        return Ok(path.clone());
    }
    let dir = dirs::config_dir()
        .context("no config directory; pass --database")?
        .join("qanban");
    Ok(dir.join(format!("{}.db", args.name)))
}

fn print_contract(id: &ContractId, contract: &Contract) {
    println!(
        "{}",
        serde_json::json!({ "id": id, "contract": contract })
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("qanban=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let path = database_path(&args)?;
    if args.clean && path.exists() {
        std::fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let ledger = SqliteLedger::open(&path).with_context(|| format!("opening {}", path.display()))?;
    let mut replica = Replica::new(args.name.clone(), ledger);

    let mut client = RelayClient::connect(&args.relay)
        .await
        .with_context(|| format!("connecting to {}", args.relay))?;
    client.login(&args.name).await?;
    info!(party = %args.name, relay = %args.relay, db = %path.display(), "Node started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if line == "list" {
                    for (id, contract) in replica.ledger().fetch_all()? {
                        print_contract(&id, &contract);
                    }
                    continue;
                }
                let command: Command = match protocol::decode(line) {
                    Ok(command) => command,
                    Err(e) => {
                        warn!("Ignoring command: {}", e);
                        continue;
                    }
                };
                match replica.prepare(command) {
                    Ok(envelope) => client.send(&envelope).await?,
                    Err(e) => warn!("Command refused: {}", e),
                }
            }

            text = client.receive_raw() => {
                let text = text?;
                if let Ok(frame) = protocol::decode::<ErrorFrame>(&text) {
                    bail!("relay closed the connection: {}", frame.error);
                }
                match replica.handle_inbound(&text) {
                    Ok((id, contract)) => print_contract(&id, &contract),
                    Err(e) => warn!("Dropping inbound message: {}", e),
                }
            }
        }
    }

    client.close().await?;
    Ok(())
}
