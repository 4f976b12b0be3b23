use anyhow::{Context, Result};
use clap::Parser;
use flate2::bufread::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

mod entry;
mod matcher;
mod parse;
mod report;
mod syms;

use entry::Entry;
use matcher::EntryMatcher;
use parse::LogParser;
use syms::{MemoryMap, Symbolizer};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Debug, Error)]
enum InputError {
    #[error("failed to open log {path}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to read log header")]
    Peek(#[source] io::Error),
}

/// Find leaked allocations in a malloc trace log
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Log file to analyse, plain or gzip compressed. Reads stdin when absent or `-`
    #[clap(parse(from_os_str))]
    input: Option<PathBuf>,
    /// Demangle symbol names in backtrace frames
    #[clap(long)]
    demangle: bool,
    /// Map raw frame addresses onto the modules listed in the log's memory map
    #[clap(long)]
    resolve_maps: bool,
    /// Print an interim report after every N entries
    #[clap(long, value_name = "N")]
    report_every: Option<usize>,
    /// More output on stderr, repeat for more detail
    #[clap(short, long, parse(from_occurrences))]
    verbose: u8,
}

fn open_input(path: Option<&Path>) -> Result<Box<dyn BufRead>, InputError> {
    let mut reader: Box<dyn BufRead> = match path {
        None => Box::new(BufReader::new(io::stdin())),
        Some(path) if path == Path::new("-") => Box::new(BufReader::new(io::stdin())),
        Some(path) => {
            let file = File::open(path).map_err(|source| InputError::Open {
                path: path.to_path_buf(),
                source,
            })?;
            Box::new(BufReader::new(file))
        }
    };

    let compressed = reader
        .fill_buf()
        .map_err(InputError::Peek)?
        .starts_with(&GZIP_MAGIC);
    if compressed {
        info!("Input is gzip compressed");
        reader = Box::new(BufReader::new(MultiGzDecoder::new(reader)));
    }
    Ok(reader)
}

struct Session {
    matcher: EntryMatcher,
    symbolizer: Symbolizer,
    report_every: Option<usize>,
    processed: usize,
}

impl Session {
    fn feed<W: Write>(&mut self, entry: Entry, maps: &MemoryMap, out: &mut W) -> io::Result<()> {
        let entry = self.symbolizer.symbolize(entry, maps);
        if let Some(diagnostic) = self.matcher.process_entry(entry) {
            warn!("{diagnostic}");
        }
        self.processed += 1;

        if let Some(every) = self.report_every.filter(|n| *n > 0) {
            if self.processed % every == 0 {
                report::render(self.matcher.state(), out)?;
                writeln!(out)?;
            }
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to install log subscriber")?;

    let mut reader = open_input(args.input.as_deref())?;
    let mut parser = LogParser::new();
    let mut session = Session {
        matcher: EntryMatcher::new(),
        symbolizer: Symbolizer::new(args.demangle, args.resolve_maps),
        report_every: args.report_every,
        processed: 0,
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader
            .read_until(b'\n', &mut buf)
            .context("failed to read log")?;
        if read == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        if let Some(entry) = parser.push_line(&line) {
            session.feed(entry, &parser.session().maps, &mut out)?;
        }
    }
    if let Some(entry) = parser.finish() {
        session.feed(entry, &parser.session().maps, &mut out)?;
    }

    let info = parser.session();
    info!(
        pid = ?info.pid,
        exe = ?info.exe,
        cwd = ?info.cwd,
        modules = info.maps.len(),
        "Processed {} entries",
        session.processed
    );
    if args.resolve_maps && info.maps.is_empty() {
        warn!("--resolve-maps given but the log has no memory map");
    }

    report::render(session.matcher.state(), &mut out).context("failed to write report")?;
    out.flush()?;
    Ok(())
}
