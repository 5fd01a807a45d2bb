//! Sender entry point: walks a directory and syncs it to the paired
//! receiver over stdin/stdout.

use std::path::PathBuf;
use std::process::exit;

use anyhow::Result;
use clap::Parser;

use qsync::proto::Compression;
use qsync::send::Sender;
use qsync::{setup_logging, Options};

#[derive(Debug, Parser)]
#[command(
    name = "qsync-send",
    about = "Synchronize a directory to the paired receiver over stdio"
)]
struct Args {
    /// Disable compression
    #[arg(short = 'n')]
    no_compress: bool,

    /// Ignore symbolic links
    #[arg(short = 'i')]
    ignore_symlinks: bool,

    /// Verbosity: 0=none, 1=error, 2=warn, 3=info, 4=debug, 5=trace
    #[arg(short = 'v', default_value_t = 3, value_name = "N")]
    verbosity: u8,

    /// Directory to sync
    path: PathBuf,
}

fn main() {
    let args = Args::parse();
    setup_logging(args.verbosity);
    if let Err(e) = run(&args) {
        eprintln!("qsync-send: {e:#}");
        exit(1);
    }
}

fn run(args: &Args) -> Result<()> {
    let mut opts = Options {
        verbosity: args.verbosity,
        ignore_symlinks: args.ignore_symlinks,
        ..Options::default()
    };
    if args.no_compress {
        opts.compression = Compression::Off;
    }

    let stdout = std::io::stdout().lock();
    let stdin = std::io::stdin().lock();
    let mut sender = Sender::new(stdout, stdin, opts)?;
    sender.sync(&args.path)
}
