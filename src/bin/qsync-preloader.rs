//! Set-uid entry point: prepares the jail and launches the trusted
//! receiver binary inside it as the unprivileged target user.

#[cfg(target_os = "linux")]
fn main() {
    use clap::Parser;
    use std::path::{Path, PathBuf};

    #[derive(Debug, Parser)]
    #[command(
        name = "qsync-preloader",
        about = "Stage and execute the receiver binary inside the sync jail"
    )]
    struct Args {
        /// Path to the trusted receiver binary
        binary: PathBuf,
    }

    let args = Args::parse();
    qsync::setup_logging(3);
    match qsync::jail::exec_jailed(
        qsync::jail::DEST_USER,
        Path::new(qsync::jail::DEST_ROOT),
        &args.binary,
    ) {
        Ok(status) => std::process::exit(status.code().unwrap_or(1)),
        Err(e) => {
            eprintln!("qsync-preloader: {e:#}");
            std::process::exit(1);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("qsync-preloader: only supported on Linux");
    std::process::exit(1);
}
