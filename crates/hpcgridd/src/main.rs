//! hpcgridd — the HPCGrid replay harness.
//!
//! Assembles the engine around a persistent state store and applies an
//! ordered event log through the keeper, the way a host ledger would:
//! - Engine params (`hpcgrid.toml`)
//! - State store (redb)
//! - In-process escrow funded by log deposits
//! - Keeper + end-of-cycle hook
//!
//! # Usage
//!
//! ```text
//! hpcgridd init-config --out hpcgrid.toml
//! hpcgridd replay --config hpcgrid.toml --events events.jsonl --data-dir /var/lib/hpcgrid
//! ```

mod replay;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hpc_core::EngineParams;
use hpcgrid_keeper::Keeper;
use hpcgrid_settlement::InMemoryEscrow;
use hpcgrid_state::StateStore;

use crate::replay::Replayer;

const DEFAULT_FILTER: &str = "info,hpcgridd=debug,hpcgrid=debug";

#[derive(Parser)]
#[command(name = "hpcgridd", about = "HPCGrid replay harness")]
struct Cli {
    /// Emit logs as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply an ordered JSON-lines event log to a fresh state store.
    Replay {
        /// Engine params (TOML). Seeds genesis on an empty store.
        #[arg(long, default_value = "hpcgrid.toml")]
        config: PathBuf,

        /// Event log, one JSON object per line.
        #[arg(long)]
        events: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/hpcgrid")]
        data_dir: PathBuf,

        /// Remove an existing state store before replaying.
        #[arg(long)]
        reset: bool,

        /// Write produced events here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Print the default engine params as TOML.
    InitConfig {
        /// Write to this file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json)?;

    match cli.command {
        Command::Replay {
            config,
            events,
            data_dir,
            reset,
            out,
        } => run_replay(config, events, data_dir, reset, out),
        Command::InitConfig { out } => init_config(out),
    }
}

fn init_tracing(json: bool) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(DEFAULT_FILTER)?,
    };
    // Logs go to stderr; stdout carries the event stream.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn run_replay(
    config: PathBuf,
    events: PathBuf,
    data_dir: PathBuf,
    reset: bool,
    out: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("HPCGrid replay starting");

    let params = EngineParams::from_file(&config)
        .with_context(|| format!("loading params from {}", config.display()))?;
    info!(path = ?config, denom = %params.denom, mode = ?params.routing.mode, "params loaded");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("hpcgrid.redb");
    if db_path.exists() {
        if !reset {
            // Escrow balances live in process memory and cannot be resumed.
            bail!(
                "state store {} already exists; pass --reset to replay from scratch",
                db_path.display()
            );
        }
        std::fs::remove_file(&db_path)?;
        info!(path = ?db_path, "previous state store removed");
    }

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let keeper = Keeper::new(store, InMemoryEscrow::new(), &params)?;
    let mut replayer = Replayer::new(keeper);

    let log = File::open(&events)
        .with_context(|| format!("opening event log {}", events.display()))?;
    let reader = BufReader::new(log);
    match out {
        Some(path) => {
            let mut writer = BufWriter::new(File::create(&path)?);
            replayer.run(reader, &mut writer)?;
            info!(path = ?path, "events written");
        }
        None => {
            let mut writer = std::io::stdout().lock();
            replayer.run(reader, &mut writer)?;
        }
    }

    let summary = replayer.summary();
    info!(
        lines = summary.lines,
        applied = summary.applied,
        rejected = summary.rejected,
        deposits = summary.deposits,
        cycles = summary.cycles,
        events = summary.events,
        "replay complete"
    );
    for (address, balance) in replayer.balances()? {
        info!(address = %address, balance, "escrow balance");
    }
    Ok(())
}

fn init_config(out: Option<PathBuf>) -> anyhow::Result<()> {
    let toml = EngineParams::default().to_toml_string()?;
    match out {
        Some(path) => {
            std::fs::write(&path, toml)?;
            info!(path = ?path, "default params written");
        }
        None => print!("{toml}"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_config_output_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hpcgrid.toml");
        init_config(Some(path.clone())).unwrap();
        let params = EngineParams::from_file(&path).unwrap();
        assert_eq!(params, EngineParams::default());
    }

    #[test]
    fn replay_refuses_existing_store_without_reset() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("hpcgrid.toml");
        init_config(Some(config.clone())).unwrap();
        let events = dir.path().join("events.jsonl");
        std::fs::write(&events, "{\"height\":1,\"time\":10,\"cycle\":true}\n").unwrap();
        let data_dir = dir.path().join("data");
        let out = dir.path().join("out.jsonl");

        run_replay(config.clone(), events.clone(), data_dir.clone(), false, Some(out.clone()))
            .unwrap();
        assert!(data_dir.join("hpcgrid.redb").exists());

        let err = run_replay(config.clone(), events.clone(), data_dir.clone(), false, None)
            .unwrap_err();
        assert!(err.to_string().contains("--reset"));

        run_replay(config, events, data_dir, true, Some(out)).unwrap();
    }
}
