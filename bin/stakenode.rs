use clap::{Parser, Subcommand};
use serde::Serialize;
use stakenode::config::NodeConfig;
use stakenode::context::{RunContext, Verbosity};
use stakenode::intake::IntakeRecord;
use stakenode::node::{unix_now, NodeCore};
use stakenode::sync::{Flow, HttpPeer, PeerClient, Progress};
use stakenode::types::Hash32;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug, Clone)]
#[command(name = "stakenode", version, about = "Single-node proof-of-stake core")]
struct Args {
    /// Path to config file (TOML). Missing file means defaults.
    #[arg(long, default_value = "stakenode.toml")]
    config: String,

    /// Override node.data_dir
    #[arg(long)]
    data: Option<String>,

    /// Override node.node_id
    #[arg(long)]
    node_id: Option<String>,

    /// Override node.log_level (RUST_LOG still wins)
    #[arg(long)]
    log_level: Option<String>,

    /// Include per-record outcomes in batch reports
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress summary log lines from batch operations
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug, Clone)]
enum Cmd {
    /// Write a commented example config to --out
    InitConfig {
        #[arg(long, default_value = "stakenode.toml")]
        out: String,
    },
    /// Generate a validator key and add it to the keyring
    Keygen,
    /// Create block 0 from the keyring validators
    Genesis,
    /// Queue a raw signed transaction for intake
    Submit {
        /// 0x-prefixed RLP bytes
        #[arg(long)]
        raw: String,
        /// Hash reported by the submitter
        #[arg(long)]
        hash: Option<String>,
        /// Queue file name (defaults to a time-ordered name)
        #[arg(long)]
        name: Option<String>,
    },
    /// Normalize and admit queued transactions
    Admit,
    /// Drop expired mempool entries and re-score the rest
    Sweep,
    /// Attempt one block at the next height
    Produce,
    /// Pull missing state from peers
    Sync {
        /// Peer base URLs; replaces sync.peers from the config
        #[arg(long = "peer")]
        peers: Vec<String>,
        /// Stop after this many pages; the next run resumes
        #[arg(long)]
        max_pages: Option<usize>,
    },
    /// Height, tip, pool and peer reachability
    Status {
        /// Skip peer probes
        #[arg(long)]
        offline: bool,
    },
    /// Replay binary ledger records missing from the mirror
    Reconcile,
    /// Walk the chain and check linkage, hashes and mirror coverage
    Verify,
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Cmd::InitConfig { out } = &args.cmd {
        NodeConfig::write_example(out)?;
        println!("Wrote example {out}");
        return Ok(());
    }

    let mut cfg = NodeConfig::load(&args.config)?;
    if let Some(v) = &args.data      { cfg.node.data_dir = v.clone(); }
    if let Some(v) = &args.node_id   { cfg.node.node_id = v.clone(); }
    if let Some(v) = &args.log_level { cfg.node.log_level = v.clone(); }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.node.log_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let ctx = RunContext::new(if args.verbose {
        Verbosity::Verbose
    } else if args.quiet {
        Verbosity::Quiet
    } else {
        Verbosity::Normal
    });

    let mut node = NodeCore::open(cfg)?;
    let now = unix_now();

    match args.cmd {
        Cmd::InitConfig { .. } => {}
        Cmd::Keygen => {
            let address = node.generate_key()?;
            info!(%address, "validator key generated");
            print_json(&serde_json::json!({ "address": address, "keys": node.keyring().len() }))?;
        }
        Cmd::Genesis => {
            let block = node.init_genesis(now)?;
            print_json(&serde_json::json!({
                "height": block.height(),
                "hash": block.hash,
                "creator": block.header.creator,
            }))?;
        }
        Cmd::Submit { raw, hash, name } => {
            let hash = hash.as_deref().map(Hash32::from_hex).transpose().map_err(anyhow::Error::msg)?;
            let name = name.unwrap_or_else(|| format!("{now:012}-{}", std::process::id()));
            let record = IntakeRecord { raw, hash, parsed: None };
            let path = node.submit_raw(&name, &record)?;
            print_json(&serde_json::json!({ "queued": path }))?;
        }
        Cmd::Admit => print_json(&node.admit_intake(now, &ctx)?)?,
        Cmd::Sweep => print_json(&node.sweep_mempool(now)?)?,
        Cmd::Produce => print_json(&node.produce_block(now)?)?,
        Cmd::Sync { peers, max_pages } => {
            let clients: Vec<Box<dyn PeerClient>> = if peers.is_empty() {
                node.configured_peers()?
            } else {
                let c = node.config();
                peers
                    .iter()
                    .map(|url| -> anyhow::Result<Box<dyn PeerClient>> {
                        Ok(Box::new(HttpPeer::new(url, c.connect_timeout(), c.request_timeout())?))
                    })
                    .collect::<anyhow::Result<_>>()?
            };
            let mut pages = 0usize;
            let mut on_page = |p: &Progress| {
                pages += 1;
                debug!(phase = ?p.phase, entity = %p.entity, page = p.page, synced = p.synced, "sync page");
                match max_pages {
                    Some(max) if pages >= max => Flow::Cancel,
                    _ => Flow::Continue,
                }
            };
            let report = node.sync_once(&clients, now, &mut on_page)?;
            print_json(&report)?;
        }
        Cmd::Status { offline } => {
            let peers = if offline { Vec::new() } else { node.configured_peers()? };
            print_json(&node.status(&peers))?;
        }
        Cmd::Reconcile => print_json(&node.reconcile(now)?)?,
        Cmd::Verify => {
            let report = node.verify_chain()?;
            print_json(&report)?;
            if !report.ok() {
                anyhow::bail!("chain verification found {} problem(s)", report.problems.len());
            }
        }
    }
    Ok(())
}
