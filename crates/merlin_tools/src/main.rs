//! `sstmeta` — print sstable stats sidecars as text.

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;

use merlin_storage::SstableStats;

#[derive(Parser)]
#[command(name = "sstmeta", about = "Render sstable metadata sidecars")]
struct Args {
    /// One or more `*.stats.json` sidecar files.
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn main() {
    if let Err(e) = run(Args::parse()) {
        eprintln!("sstmeta: error: {:#}", e);
        process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    for (index, path) in args.files.iter().enumerate() {
        if index > 0 {
            println!();
        }
        let stats = SstableStats::read_json(path)
            .with_context(|| format!("reading {}", path.display()))?;
        print!("{}", stats.render());
    }
    Ok(())
}
