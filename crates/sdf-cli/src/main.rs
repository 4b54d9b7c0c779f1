#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sdf::{DiffEngine, DiffEntry, SnapshotDir, SubvolumeIndex};
use std::path::{Path, PathBuf};

// ── CLI definition ──────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "snapdiff", about = "btrfs snapshot diff via send streams")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Diff two read-only snapshots of a subvolume.
    Diff {
        /// Base subvolume directory the snapshots live beneath.
        base: PathBuf,
        /// First (older) snapshot directory.
        snapshot1: PathBuf,
        /// Second (newer) snapshot directory.
        snapshot2: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
    /// List the subvolumes the resolver finds beneath a base directory.
    Subvolumes {
        /// Base subvolume directory.
        base: PathBuf,
        /// Output in JSON format.
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("SNAPDIFF_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Diff {
            base,
            snapshot1,
            snapshot2,
            json,
        } => run_diff(&base, &snapshot1, &snapshot2, json),
        Command::Subvolumes { base, json } => run_subvolumes(&base, json),
    }
}

fn run_diff(base: &Path, snapshot1: &Path, snapshot2: &Path, json: bool) -> Result<()> {
    let base = SnapshotDir::open(base)
        .with_context(|| format!("opening base {}", base.display()))?;
    let dir1 = SnapshotDir::open(snapshot1)
        .with_context(|| format!("opening snapshot {}", snapshot1.display()))?;
    let dir2 = SnapshotDir::open(snapshot2)
        .with_context(|| format!("opening snapshot {}", snapshot2.display()))?;

    let mut entries: Vec<DiffEntry> = Vec::new();
    DiffEngine::new(&base, &dir1, &dir2)
        .compare(|path, status| {
            entries.push(DiffEntry {
                path: path.to_path_buf(),
                status,
            });
        })
        .context("send-stream diff failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else {
        for entry in &entries {
            println!("{} {}", entry.status.to_letters(), entry.path.display());
        }
    }
    Ok(())
}

fn run_subvolumes(base: &Path, json: bool) -> Result<()> {
    let base = SnapshotDir::open(base)
        .with_context(|| format!("opening base {}", base.display()))?;
    let index = SubvolumeIndex::new(&base).context("subvolume enumeration failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(index.records())?);
    } else {
        for record in index.records() {
            println!(
                "{:>6}  {}  gen {:>8}  {}",
                record.root_id,
                format_uuid(&record.uuid),
                record.ctransid,
                record.path.display()
            );
        }
    }
    Ok(())
}

fn format_uuid(uuid: &[u8; 16]) -> String {
    let hex = |range: std::ops::Range<usize>| -> String {
        uuid[range].iter().map(|b| format!("{b:02x}")).collect()
    };
    format!(
        "{}-{}-{}-{}-{}",
        hex(0..4),
        hex(4..6),
        hex(6..8),
        hex(8..10),
        hex(10..16)
    )
}
