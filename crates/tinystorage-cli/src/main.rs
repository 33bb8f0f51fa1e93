//! TinyStorage CLI
//!
//! Usage:
//!   tinystorage get <file> <key> [--kind K]          Print one value
//!   tinystorage set <file> <key> <value> [--kind K]  Store one value
//!   tinystorage remove <file> <key>                  Delete one key
//!   tinystorage clear <file>                         Delete every key
//!   tinystorage list <file>                          Print keys with their kinds
//!   tinystorage dump <file>                          Print the whole store as JSON
//!   tinystorage check <file>                         Validate the file and print its header

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tinystorage::persistence::{atomic, format};
use tinystorage::{StorageValue, Store, StoreConfig};
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

mod value;

use value::InputKind;

#[derive(Parser, Debug)]
#[command(name = "tinystorage")]
#[command(about = "Inspect and edit TinyStorage files")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the value stored under a key
    Get {
        file: PathBuf,
        key: String,

        /// Fail unless the stored value has this kind
        #[arg(short, long, value_enum)]
        kind: Option<InputKind>,
    },
    /// Store a value under a key
    Set {
        file: PathBuf,
        key: String,
        value: String,

        /// How to interpret the value argument
        #[arg(short, long, value_enum, default_value = "string")]
        kind: InputKind,
    },
    /// Delete a key
    Remove { file: PathBuf, key: String },
    /// Delete every key
    Clear { file: PathBuf },
    /// List keys and their value kinds
    List { file: PathBuf },
    /// Print the whole store as JSON
    Dump { file: PathBuf },
    /// Validate the backing file and print its header
    Check { file: PathBuf },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays pipeable
    let subscriber = FmtSubscriber::builder()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let stdout = std::io::stdout();
    run(cli.command, &mut stdout.lock())
}

fn open(file: &Path, create_dirs: bool) -> Result<Arc<Store>> {
    Store::open_with_config(file, StoreConfig::default().with_create_dirs(create_dirs))
        .with_context(|| format!("Failed to open {}", file.display()))
}

fn run(command: Commands, out: &mut impl Write) -> Result<()> {
    match command {
        Commands::Get { file, key, kind } => {
            let store = open(&file, false)?;
            let found = match kind.and_then(InputKind::value_kind) {
                Some(expected) => store.get(&key, expected)?,
                None => store.get_value(&key),
            };
            match found {
                Some(v) => writeln!(out, "{}", value::display(&v))?,
                None => bail!("Key '{}' not found in {}", key, file.display()),
            }
        }

        Commands::Set {
            file,
            key,
            value: raw,
            kind,
        } => {
            let parsed = value::parse_value(&raw, kind)
                .with_context(|| format!("Invalid value for '{}'", key))?;
            let store = open(&file, true)?;
            store.set(key, parsed)?;
            store.close()?;
        }

        Commands::Remove { file, key } => {
            let store = open(&file, false)?;
            if !store.remove(&key)? {
                bail!("Key '{}' not found in {}", key, file.display());
            }
            store.close()?;
        }

        Commands::Clear { file } => {
            let store = open(&file, false)?;
            let removed = store.remove_all()?;
            store.close()?;
            writeln!(out, "Removed {} entries", removed)?;
        }

        Commands::List { file } => {
            let store = open(&file, false)?;
            for (key, v) in store.snapshot() {
                writeln!(out, "{}\t{}", key, v.kind())?;
            }
        }

        Commands::Dump { file } => {
            let store = open(&file, false)?;
            let json = value::to_json(&StorageValue::Map(store.snapshot()));
            writeln!(out, "{}", serde_json::to_string_pretty(&json)?)?;
        }

        Commands::Check { file } => check(&file, out)?,
    }

    Ok(())
}

/// Validate a backing file without opening it as a store
fn check(file: &Path, out: &mut impl Write) -> Result<()> {
    let bytes = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    debug!("Read {} bytes from {}", bytes.len(), file.display());

    let (header, _) = format::inspect(&bytes)
        .with_context(|| format!("{} is not a valid store file", file.display()))?;
    let entries = format::decode(&bytes)
        .with_context(|| format!("{} has an undecodable payload", file.display()))?;

    writeln!(out, "version:      {}", header.version)?;
    writeln!(out, "written_at:   {}", header.written_at)?;
    writeln!(out, "entries:      {}", entries.len())?;
    writeln!(out, "payload_len:  {}", header.payload_len)?;
    writeln!(out, "checksum:     {:08x}", header.checksum)?;

    let stale = atomic::find_stale_temp_files(file)?;
    if !stale.is_empty() {
        writeln!(out, "stale temp files: {}", stale.len())?;
    }

    Ok(())
}
