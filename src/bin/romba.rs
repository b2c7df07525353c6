use std::path::{Path, PathBuf};
use std::process::exit;

use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};

use romba::hashes::rom_from_file;
use romba::{Refresher, RomDb, XmlDatParser, DEFAULT_WORKERS};

/// Args for romba
#[derive(Parser)]
#[clap(author, version, about)]
#[clap(propagate_version = true)]
struct RombaArgs {
    /// Catalog root directory
    #[clap(long, value_parser, default_value = "romba-catalog")]
    root: PathBuf,
    /// Subcommand
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Re-index a DAT tree into the catalog
    Refresh {
        /// Directory tree of .dat/.xml files
        dats: PathBuf,
        /// Parallel parse workers
        #[clap(long, value_parser, default_value_t = DEFAULT_WORKERS)]
        workers: usize,
    },
    /// Look up a hex hash, or a rom file on disk, across the indexes
    Lookup {
        /// Hex-encoded crc/md5/sha1, or a path to a file to hash
        query: String,
        /// Rom size to narrow crc/md5 lookups; negative scans all sizes
        #[clap(long, value_parser, default_value_t = -1)]
        size: i64,
    },
    /// Print per-index store statistics
    Stats,
    /// Physically delete dats orphaned more than one generation ago
    Sweep,
}

fn main() {
    env_logger::builder().filter_level(LevelFilter::Info).init();

    if let Err(e) = run(RombaArgs::parse()) {
        error!("{:#}", e);
        exit(1);
    }
}

fn run(cli: RombaArgs) -> anyhow::Result<()> {
    let db = RomDb::open(&cli.root)?;

    match cli.command {
        Commands::Refresh { dats, workers } => {
            let stats = Refresher::new(XmlDatParser).workers(workers).run(&db, &dats)?;
            info!(
                "{} files, {} dats indexed, {} swept",
                stats.files, stats.indexed, stats.swept
            );
        }
        Commands::Lookup { query, size } => {
            if Path::new(&query).is_file() {
                let rom = rom_from_file(Path::new(&query))?;
                println!(
                    "{}: size {} crc {} md5 {} sha1 {}",
                    rom.name,
                    rom.size,
                    hex::encode(rom.crc.as_deref().unwrap_or_default()),
                    hex::encode(rom.md5.as_deref().unwrap_or_default()),
                    hex::encode(rom.sha1.as_deref().unwrap_or_default()),
                );
                let dats = db.dats_for_rom(&rom)?;
                println!("{} dat(s) reference this rom:", dats.len());
                for dat in dats {
                    println!("  {} ({})", dat.name, dat.path);
                }
            } else {
                let hash = hex::decode(&query)?;
                print!("{}", db.debug_get(&hash, size)?);
            }
        }
        Commands::Stats => print!("{}", db.print_stats()?),
        Commands::Sweep => {
            let swept = db.sweep_orphans()?;
            info!("swept {} orphaned dats", swept);
        }
    }

    db.close()?;
    Ok(())
}
