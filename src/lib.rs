//! qsync: directory synchronization between isolated compartments.
//!
//! The sender walks a directory tree and streams metadata headers; the
//! receiver compares them against its local filesystem and requests only
//! the items that diverged, which the sender then replays with content.
//! Both endpoints talk over a single bidirectional byte stream (stdio,
//! supplied by the host RPC layer) with optional snappy framing.

pub mod fsutil;
pub mod proto;
pub mod recv;
pub mod send;
pub mod stream;

#[cfg(target_os = "linux")]
pub mod jail;

use proto::{Compression, CrcMode};

/// Per-session knobs. The sender builds these from its command line and
/// announces them in the version header; the receiver adopts whatever the
/// header says.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    pub compression: Compression,
    pub crc_mode: CrcMode,
    /// 0=none, 1=error, 2=warn, 3=info, 4=debug, 5=trace
    pub verbosity: u8,
    /// Sender-side only: skip symlink entries entirely.
    pub ignore_symlinks: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            compression: Compression::Snappy,
            crc_mode: CrcMode::MetadataOnly,
            verbosity: 3,
            ignore_symlinks: false,
        }
    }
}

/// Install the stderr log writer. Stdout carries the wire protocol, so
/// nothing else may ever write there.
pub fn setup_logging(verbosity: u8) {
    use tracing::level_filters::LevelFilter;

    let level = match verbosity {
        0 => LevelFilter::OFF,
        1 => LevelFilter::ERROR,
        2 => LevelFilter::WARN,
        3 => LevelFilter::INFO,
        4 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
