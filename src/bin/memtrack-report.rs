//! Print what a tracked process still has allocated, grouped by call site.
//!
//! ```bash
//! memtrack-report mem.track.4242 --map maps.4242
//! ```

use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::Parser;
use log::info;
use memtrack::{
    census::{Census, CensusError, CensusFile, ScanMethod},
    maps::MemoryMap,
    symbols::Symbolizer,
};

#[derive(Debug, Parser)]
#[command(about = "Print memory tracking results from a mem track file")]
struct Args {
    /// The backing file written by the tracked process (`<MEM_TRACK_FILE>.<pid>`)
    #[arg(value_name = "MEM_TRACK")]
    mem_track: PathBuf,

    /// A copy of the process' /proc/<pid>/maps, to print call sites as the
    /// function (or offset) in the object they belong to
    #[arg(short, long)]
    map: Option<PathBuf>,

    /// Read every record instead of skipping file holes with lseek
    #[arg(short = 'L', long)]
    no_lseek: bool,

    /// Print the census as JSON
    #[arg(long)]
    json: bool,
}

fn run(args: &Args) -> Result<(), CensusError> {
    let map = args.map.as_deref().map(MemoryMap::from_file).transpose()?;
    let method = if args.no_lseek {
        ScanMethod::Sequential
    } else {
        ScanMethod::SkipHoles
    };
    let file = CensusFile::open(&args.mem_track, method)?;
    info!(
        "{} slots, scanning with {:?}",
        file.capacity(),
        file.method()
    );
    let census = Census::from_file(&file)?;

    let stdout = io::stdout().lock();
    if args.json {
        return census.write_json(stdout);
    }
    let mut out = io::BufWriter::new(stdout);
    let mut symbolizer = map.as_ref().map(Symbolizer::new);
    for summary in &census.callers {
        match &mut symbolizer {
            Some(symbolizer) => writeln!(out, "caller: {}", symbolizer.symbolize(summary.caller))?,
            None => writeln!(out, "caller: {:#x}", summary.caller.addr())?,
        }
        writeln!(out, "  entries: {}", summary.entries)?;
        writeln!(out, "  total bytes: {}", summary.total_bytes)?;
    }
    out.flush()?;
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("memtrack-report: {}: {err}", args.mem_track.display());
            ExitCode::FAILURE
        }
    }
}
