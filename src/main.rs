use clap::{Args, Parser, Subcommand};
use ed25519_dalek::SigningKey;
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};

use kolibri_node::block::BlockDraft;
use kolibri_node::config::Config;
use kolibri_node::formula::{FormulaDraft, FormulaFilter};
use kolibri_node::ledger::DEFAULT_BLOCK_LIMIT;
use kolibri_node::package::{read_package, write_package};
use kolibri_node::LedgerStore;

/// Database used when neither `--db` nor the config names one.
const DEFAULT_DB: &str = "kolibri.db";

/// Kolibri node - formula ledger administration
#[derive(Parser, Debug)]
#[command(name = "kolibri", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite ledger file (overrides the config)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Manage formulas
    #[command(subcommand)]
    Formula(FormulaCommand),
    /// Manage ledger blocks
    #[command(subcommand)]
    Block(BlockCommand),
    /// Show the global metrics record
    Metrics {
        /// Recompute average fitness over all scored formulas first
        #[arg(long)]
        recompute: bool,
    },
    /// Read or write settings
    #[command(subcommand)]
    Setting(SettingCommand),
    /// Write the ledger to a .kpack file
    Export { file: PathBuf },
    /// Merge a .kpack file into the ledger
    Import { file: PathBuf },
    /// Delete all formulas, blocks and metrics
    Clear,
}

#[derive(Subcommand, Debug)]
enum FormulaCommand {
    Add(FormulaArgs),
    Get {
        id: u64,
    },
    List {
        /// Only formulas carrying any of these tags
        #[arg(short, long = "tag")]
        tags: Vec<String>,
    },
    Search {
        term: String,
    },
    Delete {
        id: u64,
    },
    /// Store a mutated child of a formula
    Mutate {
        id: u64,
    },
    /// Store the crossover child of two formulas
    Crossover {
        first: u64,
        second: u64,
    },
}

#[derive(Args, Debug)]
struct FormulaArgs {
    #[arg(short, long = "tag")]
    tags: Vec<String>,
    #[arg(short, long = "input")]
    inputs: Vec<String>,
    #[arg(short, long = "output")]
    outputs: Vec<String>,
    #[arg(short, long)]
    fitness: Option<f64>,
    #[arg(long)]
    code: Option<String>,
    #[arg(long, default_value_t = 0)]
    cost: u32,
}

#[derive(Subcommand, Debug)]
enum BlockCommand {
    Add {
        /// Formula ids recorded in the block
        #[arg(short, long = "formula")]
        formulas: Vec<u64>,
        /// JSON payload
        #[arg(short, long)]
        data: Option<String>,
        /// Hex-encoded ed25519 secret key to sign the block with
        #[arg(long)]
        signing_key: Option<String>,
    },
    Get {
        number: u64,
    },
    List {
        #[arg(short, long, default_value_t = DEFAULT_BLOCK_LIMIT)]
        limit: usize,
    },
    /// Check hashes, links and signatures of the whole chain
    Verify,
}

#[derive(Subcommand, Debug)]
enum SettingCommand {
    Get { key: String },
    Set { key: String, value: String },
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_signing_key(raw: &str) -> Result<SigningKey, Box<dyn std::error::Error>> {
    let bytes: [u8; 32] = hex::decode(raw.trim_start_matches("0x"))?
        .try_into()
        .map_err(|_| "signing key must be 32 bytes")?;
    Ok(SigningKey::from_bytes(&bytes))
}

fn open_ledger(cli: &Cli) -> Result<LedgerStore, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(db) = &cli.db {
        config.storage.path = Some(db.clone());
    }
    let path = config
        .storage
        .path
        .get_or_insert_with(|| PathBuf::from(DEFAULT_DB));
    info!(db = %path.display(), "opening ledger");
    Ok(LedgerStore::from_config(&config.storage)?)
}

fn run_formula(
    store: &LedgerStore,
    cmd: FormulaCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        FormulaCommand::Add(args) => {
            let draft = FormulaDraft {
                fitness: args.fitness,
                code: args.code,
                cost: args.cost,
                ..FormulaDraft::default()
            }
            .with_tags(args.tags)
            .with_io(args.inputs, args.outputs);
            let id = store.create_formula(draft)?;
            print_json(&serde_json::json!({ "id": id }))
        }
        FormulaCommand::Get { id } => print_json(&store.get_formula(id)?),
        FormulaCommand::List { tags } => {
            print_json(&store.list_formulas(&FormulaFilter::any_tag(tags))?)
        }
        FormulaCommand::Search { term } => print_json(&store.search_formulas(&term)?),
        FormulaCommand::Delete { id } => {
            store.delete_formula(id)?;
            print_json(&serde_json::json!({ "deleted": id }))
        }
        FormulaCommand::Mutate { id } => {
            let child = store.mutate_formula(id)?;
            print_json(&store.get_formula(child)?)
        }
        FormulaCommand::Crossover { first, second } => {
            let child = store.crossover_formulas(first, second)?;
            print_json(&store.get_formula(child)?)
        }
    }
}

fn run_block(
    store: &LedgerStore,
    cmd: BlockCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        BlockCommand::Add {
            formulas,
            data,
            signing_key,
        } => {
            let draft = BlockDraft {
                formula_ids: formulas,
                data: match data {
                    Some(raw) => serde_json::from_str(&raw)?,
                    None => serde_json::Value::Null,
                },
            };
            let block = match signing_key {
                Some(raw) => store.create_signed_block(draft, &parse_signing_key(&raw)?)?,
                None => store.create_block(draft)?,
            };
            print_json(&block)
        }
        BlockCommand::Get { number } => print_json(&store.get_block(number)?),
        BlockCommand::List { limit } => print_json(&store.list_blocks(limit)?),
        BlockCommand::Verify => {
            store.verify_chain()?;
            let head = store.get_latest_block()?;
            print_json(&serde_json::json!({
                "valid": true,
                "height": head.map(|b| b.block_number + 1).unwrap_or(0),
            }))
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // stdout carries the JSON output
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    let store = open_ledger(&cli)?;
    debug!(command = ?cli.command, "running command");

    match cli.command {
        Command::Formula(cmd) => run_formula(&store, cmd),
        Command::Block(cmd) => run_block(&store, cmd),
        Command::Metrics { recompute } => {
            if recompute {
                store.metrics().recompute_avg_fitness()?;
            }
            print_json(&store.get_metrics()?)
        }
        Command::Setting(SettingCommand::Get { key }) => {
            let value = store.get_setting(&key)?;
            print_json(&serde_json::json!({ "key": key, "value": value }))
        }
        Command::Setting(SettingCommand::Set { key, value }) => {
            store.set_setting(&key, &value)?;
            print_json(&serde_json::json!({ "key": key, "value": value }))
        }
        Command::Export { file } => {
            let package = store.export_data()?;
            write_package(&file, &package)?;
            print_json(&serde_json::json!({
                "file": file,
                "formulas": package.formulas.len(),
                "blocks": package.blocks.len(),
                "metrics": package.metrics.len(),
            }))
        }
        Command::Import { file } => {
            let summary = store.import_data(&read_package(&file)?)?;
            print_json(&summary)
        }
        Command::Clear => {
            store.clear_all()?;
            print_json(&serde_json::json!({ "cleared": true }))
        }
    }
}
