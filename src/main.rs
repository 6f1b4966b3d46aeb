//! widewalk - breadth-first find
//!
//! Entry point for the demo CLI: walks the given paths and prints each
//! entry, breadth-first by default.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::EnvFilter;
use widewalk::{walk, Action, FileType, Strategy, Visit, WalkFlags, WalkOptions};

/// Breadth-first filesystem walker
#[derive(Parser, Debug)]
#[command(
    name = "widewalk",
    version,
    about = "Breadth-first filesystem walker",
    long_about = "Walks filesystem trees breadth-first by default and prints each path.\n\n\
                  Alternative strategies: depth-first (dfs), iterative deepening (ids),\n\
                  and exponential deepening (eds).",
    after_help = "EXAMPLES:\n    \
        widewalk /usr/share\n    \
        widewalk -S dfs --sort src\n    \
        widewalk -j 4 --depth /var/log\n    \
        widewalk --xdev --unique /"
)]
struct CliArgs {
    /// Paths to walk (defaults to the current directory)
    #[arg(value_name = "PATH")]
    paths: Vec<PathBuf>,

    /// Search strategy
    #[arg(short = 'S', long, value_enum, default_value_t = StrategyArg::Bfs)]
    strategy: StrategyArg,

    /// Number of I/O threads (0 = fully synchronous)
    #[arg(short = 'j', long = "threads", default_value = "1", value_name = "N")]
    threads: usize,

    /// Follow symlinks on the command line only
    #[arg(short = 'H')]
    follow_roots: bool,

    /// Follow all symlinks
    #[arg(short = 'L')]
    follow_all: bool,

    /// Visit directory contents before the directory itself
    #[arg(long = "depth")]
    post_order: bool,

    /// Don't descend into other filesystems
    #[arg(long = "xdev", alias = "mount")]
    xdev: bool,

    /// Visit each directory's entries in sorted order
    #[arg(long)]
    sort: bool,

    /// Skip files already seen (dedup by device and inode)
    #[arg(long)]
    unique: bool,

    /// Maximum number of open file descriptors
    #[arg(long, default_value = "4096", value_name = "N")]
    max_open: usize,

    /// Verbose output (show per-path errors)
    #[arg(short = 'v', long)]
    verbose: bool,
}

/// Search strategy names as accepted on the command line
#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Bfs,
    Dfs,
    Ids,
    Eds,
}

impl From<StrategyArg> for Strategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Bfs => Strategy::Bfs,
            StrategyArg::Dfs => Strategy::Dfs,
            StrategyArg::Ids => Strategy::Ids,
            StrategyArg::Eds => Strategy::Eds,
        }
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(clean) if clean => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<bool> {
    let args = CliArgs::parse();

    setup_logging(args.verbose)?;

    let mut paths = args.paths.clone();
    if paths.is_empty() {
        paths.push(PathBuf::from("."));
    }

    let mut flags = WalkFlags::RECOVER;
    if args.follow_roots {
        flags |= WalkFlags::FOLLOW_ROOTS;
    }
    if args.follow_all {
        flags |= WalkFlags::FOLLOW_ALL | WalkFlags::DETECT_CYCLES;
    }
    if args.post_order {
        flags |= WalkFlags::POST_ORDER | WalkFlags::BUFFER;
    }
    if args.xdev {
        flags |= WalkFlags::PRUNE_MOUNTS;
    }
    if args.sort {
        flags |= WalkFlags::SORT;
    }
    if args.unique {
        // Dedup needs every entry's identity up front
        flags |= WalkFlags::STAT;
    }

    let options = WalkOptions {
        flags,
        strategy: args.strategy.into(),
        max_open: args.max_open,
        threads: args.threads,
        mtab: None,
    };

    let post_order = args.post_order;
    let unique = args.unique;
    let verbose = args.verbose;
    let mut seen: HashSet<(u64, u64)> = HashSet::new();
    let mut errors: u64 = 0;

    let result = walk(
        &paths,
        |entry| {
            if entry.file_type() == FileType::Error {
                errors += 1;
                if verbose {
                    let errno = entry.error().map(|e| e.0).unwrap_or(0);
                    eprintln!(
                        "widewalk: {}: {}",
                        entry.path().display(),
                        std::io::Error::from_raw_os_error(errno)
                    );
                }
                return Action::Continue;
            }

            if unique && entry.visit() == Visit::Pre {
                let flags = entry.stat_flags();
                if let Ok(buf) = entry.stat(flags) {
                    if !seen.insert((buf.dev(), buf.ino())) {
                        return Action::Prune;
                    }
                }
            }

            // With --depth, directories print on their post-order visit
            let print = if post_order && entry.file_type() == FileType::Directory {
                entry.visit() == Visit::Post
            } else {
                entry.visit() == Visit::Pre
            };
            if print {
                println!("{}", entry.path().display());
            }

            Action::Continue
        },
        &options,
    );

    match result {
        Ok(()) => Ok(errors == 0),
        Err(e) => {
            // The walk already visited what it could; report and fail
            eprintln!("widewalk: {}", e);
            Ok(false)
        }
    }
}

fn setup_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;

    Ok(())
}
