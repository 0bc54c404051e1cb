//! `twoskip`: inspect and operate on twoskip database files from the
//! command line.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use twoskip_core::{check_consistency, Config, Engine, OpenFlags};

#[derive(Parser)]
#[command(name = "twoskip", about = "Inspect and operate on twoskip database files", version)]
struct Cli {
    /// Path to the database file.
    db: PathBuf,

    /// Use the mailbox-hierarchy comparator instead of raw byte order.
    #[arg(long, global = true)]
    mboxsort: bool,

    /// Path to a TOML file overriding the default tunables.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Creates an empty database if it does not already exist.
    Create,
    /// Fetches the value for `key` and prints it to stdout.
    Get {
        key: String,
    },
    /// Stores `key -> value`, failing if the key already exists unless `--force`.
    Put {
        key: String,
        value: String,
        #[arg(long)]
        force: bool,
    },
    /// Deletes `key`, failing if it does not exist unless `--force`.
    Delete {
        key: String,
        #[arg(long)]
        force: bool,
    },
    /// Lists every key (and optionally value) at or after `prefix`.
    List {
        #[arg(default_value = "")]
        prefix: String,
        #[arg(long)]
        values: bool,
    },
    /// Runs a consistency check over the whole file.
    Check,
    /// Forces an immediate checkpoint.
    Checkpoint,
    /// Prints Prometheus-format operational counters for this handle's lifetime.
    Metrics,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_sources(Some(path)).context("loading config overlay")?,
        None => Config::default(),
    };
    let flags = OpenFlags {
        create: matches!(cli.command, Command::Create),
        mboxsort: cli.mboxsort,
    };
    let engine = Engine::open(&cli.db, flags, config).context("opening database")?;

    match cli.command {
        Command::Create => {
            println!("created {}", cli.db.display());
        }
        Command::Get { key } => {
            let value = engine.fetch(key.as_bytes()).context("fetch failed")?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Command::Put { key, value, force } => {
            engine.store(key.as_bytes(), value.as_bytes(), force).context("store failed")?;
        }
        Command::Delete { key, force } => {
            engine.delete(key.as_bytes(), force).context("delete failed")?;
        }
        Command::List { prefix, values } => {
            let prefix_bytes = prefix.as_bytes();
            engine.foreach(
                prefix_bytes,
                |k| k.starts_with(prefix_bytes),
                |k, v| {
                    if values {
                        println!("{}\t{}", String::from_utf8_lossy(k), String::from_utf8_lossy(v));
                    } else {
                        println!("{}", String::from_utf8_lossy(k));
                    }
                    Ok(0)
                },
            )?;
        }
        Command::Check => {
            let live = check_consistency(&engine).context("consistency check failed")?;
            println!("ok: {live} live records");
        }
        Command::Checkpoint => {
            engine.checkpoint().context("checkpoint failed")?;
        }
        Command::Metrics => {
            print!("{}", engine.metrics().export_prometheus(&cli.db.display().to_string()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
