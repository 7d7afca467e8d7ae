// Copyright (c) 2024 Botho Foundation

//! Offline maintenance for a chain stored in LMDB.
//!
//! The node must not be running: these commands open the store directly.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use hybrid_chain::block::short_hash;
use hybrid_chain::config::ChainConfig;
use hybrid_chain::difficulty::DifficultyCalculator;
use hybrid_chain::ledger::{BlockIndex, BlockStore, IntegrityStatus};
use hybrid_chain::recovery::RecoveryManager;
use hybrid_chain::state::StateAccess;
use hybrid_chain::storage::{KeyValueStore, LmdbStore};
use hybrid_chain::telemetry;

#[derive(Parser)]
#[command(name = "chain-admin")]
#[command(about = "Inspect and repair a hybrid chain database", long_about = None)]
struct Cli {
    /// Directory holding the LMDB store
    #[arg(short, long)]
    data_dir: PathBuf,

    /// Path to the chain config file (defaults apply if omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the persisted head and whether its world state is complete
    Status,

    /// Verify cumulative difficulties in the block index, repairing if possible
    CheckIndex,

    /// Move the head back to the newest block with a complete world state
    RecoverState,

    /// Rebuild the index record of a stored block
    RecoverIndex {
        /// Block hash (hex)
        hash: String,
    },
}

struct Handles {
    store: Arc<dyn KeyValueStore>,
    blocks: BlockStore,
    index: BlockIndex,
    config: ChainConfig,
    calculator: DifficultyCalculator,
}

impl Handles {
    fn open(cli: &Cli) -> Result<Self> {
        let config = match &cli.config {
            Some(path) => ChainConfig::load(path)?,
            None => ChainConfig::default(),
        };
        let store: Arc<dyn KeyValueStore> = Arc::new(
            LmdbStore::open(&cli.data_dir)
                .with_context(|| format!("Failed to open {}", cli.data_dir.display()))?,
        );
        Ok(Self {
            blocks: BlockStore::new(store.clone()),
            index: BlockIndex::new(store.clone()),
            calculator: DifficultyCalculator::new(&config),
            store,
            config,
        })
    }

    fn best_hash(&self) -> Result<[u8; 32]> {
        self.blocks
            .best_block_hash()?
            .ok_or_else(|| anyhow!("Store has no best block; was it ever initialized?"))
    }

    fn recovery(&self) -> RecoveryManager<'_> {
        RecoveryManager::new(&self.blocks, &self.index, &self.calculator, &self.config.prune)
    }
}

fn parse_hash(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str.trim_start_matches("0x")).context("Invalid hex")?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("Hash must be 32 bytes, got {}", bytes.len()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.verbose)?;
    let handles = Handles::open(&cli)?;

    match &cli.command {
        Commands::Status => {
            let best = handles.best_hash()?;
            let block = handles.blocks.require_block(&best)?;
            let record = handles
                .index
                .record(&best)?
                .ok_or_else(|| anyhow!("Head {} is not indexed", short_hash(&best)))?;
            let state = StateAccess::new(handles.store.clone(), block.header.state_root);

            println!("Head:             {}", hex::encode(best));
            println!("Height:           {}", block.number());
            println!("Seal:             {}", block.seal_kind());
            println!("Total difficulty: {}", record.total_difficulty);
            println!("Index size:       {}", handles.index.size()?);
            println!(
                "World state:      {}",
                if state.is_valid_root(&block.header.state_root) {
                    "complete"
                } else {
                    "INCOMPLETE"
                }
            );
        }

        Commands::CheckIndex => {
            let status = handles.index.integrity_check(&handles.calculator)?;
            println!("Index status: {status}");
            if !status.is_usable() {
                bail!("Block index cannot be repaired in place");
            }
            if status == IntegrityStatus::Fixed {
                println!("Corrupted cumulative difficulties were rewritten");
            }
        }

        Commands::RecoverState => {
            let best = handles.best_hash()?;
            let head = handles.blocks.require_block(&best)?;
            let mut state = StateAccess::new(handles.store.clone(), head.header.state_root);
            match handles.recovery().recover_world_state(&mut state, &best)? {
                Some(record) if record.hash == best => {
                    println!("World state of head #{} is complete", record.number);
                }
                Some(record) => {
                    println!(
                        "Head moved from #{} to #{} ({})",
                        head.number(),
                        record.number,
                        hex::encode(record.hash)
                    );
                }
                None => bail!("No block with a complete world state was found"),
            }
        }

        Commands::RecoverIndex { hash } => {
            let hash = parse_hash(hash)?;
            let best = handles.best_hash()?;
            if !handles.recovery().recover_index_entry(&hash, &best)? {
                bail!("Could not rebuild the index entry of {}", short_hash(&hash));
            }
            println!("Rebuilt index entry of {}", hex::encode(hash));
        }
    }

    Ok(())
}
