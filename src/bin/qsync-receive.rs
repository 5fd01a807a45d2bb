//! Receiver entry point: no arguments, driven entirely by the protocol
//! on stdin/stdout. Meant to run chroot'd in the jail the preloader
//! prepares, with the jail root as working directory.

use anyhow::Result;

use qsync::recv::Receiver;
use qsync::setup_logging;

fn main() {
    if let Err(e) = run() {
        eprintln!("qsync-receive: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let stdin = std::io::stdin().lock();
    let stdout = std::io::stdout().lock();
    // The sender's version header decides the log level.
    let mut receiver = Receiver::new(stdin, stdout)?;
    setup_logging(receiver.verbosity());
    receiver.sync()
}
