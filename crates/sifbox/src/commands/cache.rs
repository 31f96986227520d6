//! Inspect and prune the image cache.
use std::io::{self, Write};

use anyhow::Result;
use clap::{Parser, Subcommand};
use libbuild::cache::{CacheEntryInfo, CacheListing, CacheType};
use libbuild::config::BuildEnv;
use tabwriter::TabWriter;

#[derive(Subcommand, Debug)]
pub enum CacheCmd {
    List(List),
    Clean(Clean),
}

/// Show what the image cache holds
#[derive(Parser, Debug)]
pub struct List {
    /// Only these cache types, e.g. 'library', 'oci-blob', 'blob'
    #[clap(short = 'T', long = "type", value_delimiter = ',')]
    pub types: Vec<CacheType>,
    /// List every entry, not only the totals
    #[clap(short, long)]
    pub verbose: bool,
}

/// Remove cached artifacts
#[derive(Parser, Debug)]
pub struct Clean {
    /// Only these cache types
    #[clap(short = 'T', long = "type", value_delimiter = ',')]
    pub types: Vec<CacheType>,
    /// Only remove entries older than this many days
    #[clap(short, long)]
    pub days: Option<u64>,
    /// Show what would be removed without removing it
    #[clap(short = 'n', long)]
    pub dry_run: bool,
}

pub fn cache(cmd: CacheCmd) -> Result<()> {
    let env = BuildEnv::from_env()?;
    let cache = super::build::open_cache(&env, false)?;
    match cmd {
        CacheCmd::List(args) => {
            let listing = cache.list(&args.types)?;
            render_listing(&listing, args.verbose, io::stdout())?;
        }
        CacheCmd::Clean(args) => {
            let removed = cache.clean(&args.types, args.days, args.dry_run)?;
            render_removed(&removed, args.dry_run, io::stdout())?;
        }
    }
    Ok(())
}

fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

fn render_listing<W: Write>(listing: &CacheListing, verbose: bool, out: W) -> io::Result<()> {
    let mut tab_writer = TabWriter::new(out);
    if verbose {
        writeln!(&mut tab_writer, "NAME\tDATE CREATED\tSIZE\tTYPE")?;
        for entry in &listing.entries {
            writeln!(
                &mut tab_writer,
                "{}\t{}\t{}\t{}",
                entry.key,
                entry.modified.format("%Y-%m-%d %H:%M:%S"),
                human_size(entry.size),
                entry.ty
            )?;
        }
        writeln!(&mut tab_writer)?;
    }
    writeln!(&mut tab_writer, "TYPE\tCOUNT\tSIZE")?;
    for total in &listing.totals {
        writeln!(
            &mut tab_writer,
            "{}\t{}\t{}",
            total.ty,
            total.count,
            human_size(total.size)
        )?;
    }
    writeln!(
        &mut tab_writer,
        "total\t{}\t{}",
        listing.entries.len(),
        human_size(listing.total_size())
    )?;
    tab_writer.flush()
}

fn render_removed<W: Write>(removed: &[CacheEntryInfo], dry_run: bool, mut out: W) -> io::Result<()> {
    let verb = if dry_run { "Would remove" } else { "Removed" };
    for entry in removed {
        writeln!(out, "{verb} {} entry {}", entry.ty, entry.key)?;
    }
    let size: u64 = removed.iter().map(|e| e.size).sum();
    writeln!(out, "{verb} {} entries, {}", removed.len(), human_size(size))
}
