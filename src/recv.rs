//! Receiver: metadata reconciliation, content reception and stale-entry
//! deletion.
//!
//! The receiver trusts nothing about its destination: entries may exist
//! with the wrong type, stale children must go, and a directory's final
//! permissions can only land after its children have been written. It is
//! normally chroot'd into the jail and works relative to its working
//! directory; tests anchor it under a scratch root instead.

use std::collections::HashSet;
use std::fs::{self, Permissions};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, trace, warn};

use crate::fsutil::{
    self, apply_times_and_perms, crc_file, remove_if_exists, SCRATCH_LEN,
};
use crate::proto::{
    self, Compression, CrcMode, FileHeader, Phase, ResultExt, ResultHeader, VersionHeader,
    MAX_PATH_LEN, MAX_TRANSFER,
};
use crate::stream::{StreamReader, StreamWriter};
use crate::Options;

/// Names that only show up when the working directory is a real root
/// rather than the jail. Seeing any of them means the confinement the
/// deletion pass relies on is absent, so the session must die before
/// touching anything.
const ROOT_BLACKLIST: &[&str] = &[
    "bin", "boot", "dev", "etc", "home", "lost+found", "media", "mnt", "opt", "proc", "root",
    "sbin", "srv", "sys", "usr", "var",
];

pub struct Receiver<R: Read, W: Write> {
    input: StreamReader<R>,
    output: StreamWriter<W>,

    /// Anchor for every local path. Empty in production, where the jail
    /// is the working directory; tests point it at a scratch directory.
    root: PathBuf,

    total_bytes: u64,
    total_files: u64,
    files_limit: Option<u64>,
    byte_limit: Option<u64>,

    /// Next index a file/symlink header will get, mirroring the sender's
    /// send-list numbering.
    index: u32,
    request_list: Vec<u32>,

    /// Local entries the sender has not (yet) mentioned; whatever is
    /// left after the content phase gets deleted.
    to_delete: HashSet<PathBuf>,

    /// Directories visited but not yet closed by their second header.
    dir_stack: Vec<PathBuf>,

    opts: Options,
    scratch: Vec<u8>,
}

impl<R: Read, W: Write> std::fmt::Debug for Receiver<R, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("root", &self.root)
            .field("total_bytes", &self.total_bytes)
            .field("total_files", &self.total_files)
            .finish_non_exhaustive()
    }
}

impl<R: Read, W: Write> Receiver<R, W> {
    /// Reads the version header from the raw transport and adopts the
    /// options it announces.
    pub fn new(input: R, output: W) -> Result<Self> {
        Self::with_root(input, output, PathBuf::new())
    }

    /// Like [`Receiver::new`], but anchors all filesystem access under
    /// `root` instead of the working directory.
    pub fn with_root(mut input: R, output: W, root: PathBuf) -> Result<Self> {
        let v = VersionHeader::read_from(&mut input)?;
        if v.version != proto::VERSION {
            bail!("unsupported version: {}", v.version);
        }
        let compression = Compression::from_wire(v.compression)?;
        let crc_mode = CrcMode::from_wire(v.crc_usage)?;
        debug!(
            "protocol version: {}, verbosity {}, snappy: {}, crc: {:?}",
            v.version,
            v.verbosity,
            compression == Compression::Snappy,
            crc_mode
        );

        let compressed = compression == Compression::Snappy;
        Ok(Receiver {
            input: StreamReader::new(input, compressed),
            output: StreamWriter::new(output, compressed),
            root,
            total_bytes: 0,
            total_files: 0,
            files_limit: None,
            byte_limit: None,
            index: 0,
            request_list: Vec::new(),
            to_delete: HashSet::new(),
            dir_stack: Vec::new(),
            opts: Options {
                compression,
                crc_mode,
                verbosity: v.verbosity,
                ignore_symlinks: false,
            },
            scratch: vec![0u8; SCRATCH_LEN],
        })
    }

    /// Verbosity requested by the sender; drives the log level.
    pub fn verbosity(&self) -> u8 {
        self.opts.verbosity
    }

    /// Number of indices scheduled during the metadata phase.
    pub fn requested(&self) -> usize {
        self.request_list.len()
    }

    /// Optional caps on how much a single session may receive.
    pub fn set_limits(&mut self, files: Option<u64>, bytes: Option<u64>) {
        self.files_limit = files;
        self.byte_limit = bytes;
    }

    /// Run a full session against the sender on the other end.
    pub fn sync(&mut self) -> Result<()> {
        if let Err(e) = self.receive_metadata() {
            self.report_failure(&e);
            return Err(e).context("metadata receive failed");
        }
        self.request_files().context("file request failed")?;
        if let Err(e) = self.receive_content() {
            self.report_failure(&e);
            return Err(e).context("content receive failed");
        }
        let (raw, compressed) = self.output.stats();
        info!("data sent, raw: {raw}, compressed: {compressed}");
        self.delete_stale();
        Ok(())
    }

    /// Best effort: tell the sender which errno sank the phase, so it
    /// surfaces a code instead of a bare EOF.
    fn report_failure(&mut self, err: &anyhow::Error) {
        if self.send_status(error_code(err), Path::new("")).is_ok() {
            let _ = self.output.flush_frame();
        }
    }

    fn local_path(&self, rel: &Path) -> PathBuf {
        self.root.join(rel)
    }

    /// Deletion-set key: absolute, but computed without touching
    /// symlinks, so an entry pointing out of the jail never resolves to
    /// its target.
    fn snapshot_key(&self, path: &Path) -> Result<PathBuf> {
        Ok(std::path::absolute(path)?)
    }

    fn snapshot_dir(&self) -> PathBuf {
        if self.root.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            self.root.clone()
        }
    }

    /// Record the entries of `dir` (one level) as deletion candidates.
    /// With `check_root`, trip on blacklisted names first: we are
    /// supposed to be chroot'd, and a populated root means we are not.
    fn snapshot_files(&mut self, dir: &Path, check_root: bool) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
        };
        for entry in entries {
            let entry = entry?;
            if check_root {
                if let Some(name) = entry.file_name().to_str() {
                    if ROOT_BLACKLIST.contains(&name) {
                        bail!("file {} in receiver root, bailing out", name);
                    }
                }
            }
            let key = self.snapshot_key(&entry.path())?;
            self.to_delete.insert(key);
        }
        Ok(())
    }

    /// Metadata phase: compare every inbound header against the local
    /// tree and build the request list.
    fn receive_metadata(&mut self) -> Result<()> {
        self.snapshot_files(&self.snapshot_dir(), true)
            .context("snapshot failed")?;

        let mut last = PathBuf::new();
        loop {
            let hdr = FileHeader::read_from(&mut self.input)?;
            if hdr.is_eot() {
                break;
            }
            self.total_files += 1;
            if let Some(limit) = self.files_limit {
                if self.total_files > limit {
                    bail!(
                        "number of files ({}) exceeded limit ({})",
                        self.total_files,
                        limit
                    );
                }
            }
            let key = self.snapshot_key(&self.local_path(&hdr.path))?;
            self.to_delete.remove(&key);
            self.process_item_metadata(&hdr)
                .with_context(|| format!("processing metadata for {}", hdr.path.display()))?;
            last = hdr.path;
        }
        if !self.dir_stack.is_empty() {
            bail!(
                "unbalanced directory visits, {} still open at end of transfer",
                self.dir_stack.len()
            );
        }
        self.send_status(0, &last)?;
        self.output.flush_frame()?;
        Ok(())
    }

    fn process_item_metadata(&mut self, hdr: &FileHeader) -> Result<()> {
        if hdr.is_dir() {
            self.receive_dir_metadata(hdr)
        } else if hdr.is_symlink() || hdr.is_regular() {
            self.receive_file_metadata(hdr)
        } else {
            bail!("unknown file mode {:o}", hdr.mode)
        }
    }

    /// Directories arrive twice. First visit: make sure a directory we
    /// can write into exists (snapshotting any children it already has).
    /// Second visit: stamp times and the real permissions.
    fn receive_dir_metadata(&mut self, hdr: &FileHeader) -> Result<()> {
        let local = self.local_path(&hdr.path);
        if self.visit_dir(&hdr.path) {
            if let Ok(md) = fs::symlink_metadata(&local) {
                if md.is_dir() {
                    // Children may need replacing, so writability now
                    // beats the real bits; those land on the second
                    // visit.
                    fs::set_permissions(&local, Permissions::from_mode(0o700))
                        .with_context(|| format!("chmod {}", local.display()))?;
                    return self.snapshot_files(&local, false);
                }
                // A file where the sender has a directory.
                remove_if_exists(&local)?;
            }
            let mut builder = fs::DirBuilder::new();
            builder.mode(0o700);
            return builder
                .create(&local)
                .with_context(|| format!("mkdir {}", local.display()));
        }

        trace!("fixing perms for {}", hdr.path.display());
        let atime_nsec = if self.opts.crc_mode.carries_crc(Phase::Metadata) {
            0
        } else {
            hdr.atime_nsec
        };
        apply_times_and_perms(hdr, &local, atime_nsec)
    }

    /// Push on a first encounter; pop when the incoming path equals the
    /// top. Returns true for a first visit.
    fn visit_dir(&mut self, path: &Path) -> bool {
        if self.dir_stack.last().map(PathBuf::as_path) != Some(path) {
            self.dir_stack.push(path.to_path_buf());
            return true;
        }
        self.dir_stack.pop();
        false
    }

    /// Metadata for a file or symlink: schedule its index if the local
    /// entry is missing, differs in metadata, or fails the CRC check.
    fn receive_file_metadata(&mut self, hdr: &FileHeader) -> Result<()> {
        let index = self.index;
        self.index += 1;

        self.check_transfer_size(hdr.file_len)?;
        let local = self.local_path(&hdr.path);
        let md = match fs::symlink_metadata(&local) {
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.request_list.push(index);
                return Ok(());
            }
            other => other.with_context(|| format!("stat {}", local.display()))?,
        };

        let local_hdr = FileHeader::from_metadata(&hdr.path, &md);
        let mut wanted = false;
        let diffs = local_hdr.diff(hdr);
        if !diffs.is_empty() {
            debug!("file diffs for {}: {:?}", hdr.path.display(), diffs);
            wanted = true;
        }
        // The CRC is only worth computing while the entry still looks
        // identical; a scheduled index must not be scheduled twice.
        if !wanted && self.opts.crc_mode.carries_crc(Phase::Metadata) {
            let crc = crc_file(&local, &md, &mut self.scratch)?;
            if crc != hdr.atime_nsec {
                debug!(
                    "crc diff on {} (local {}, remote {})",
                    hdr.path.display(),
                    crc,
                    hdr.atime_nsec
                );
                wanted = true;
            }
        }
        if wanted {
            self.request_list.push(index);
        }
        Ok(())
    }

    /// Reject a payload that is oversized on its own or would blow the
    /// session cap.
    fn check_transfer_size(&self, len: u64) -> Result<()> {
        if len > MAX_TRANSFER {
            bail!("file too large, {} bytes", len);
        }
        if let Some(limit) = self.byte_limit {
            if self.total_bytes.saturating_add(len) > limit {
                bail!("byte limit ({}) exceeded", limit);
            }
        }
        Ok(())
    }

    /// Request phase: the indices we want, in sender-emission order.
    fn request_files(&mut self) -> Result<()> {
        debug!("requesting {} files", self.request_list.len());
        proto::write_request_list(&mut self.output, &self.request_list)?;
        self.output.flush_frame()?;
        Ok(())
    }

    /// Content phase: one header + payload per requested index, in
    /// request order.
    fn receive_content(&mut self) -> Result<()> {
        let mut last = PathBuf::new();
        let wanted = self.request_list.clone();
        for index in wanted {
            let hdr = FileHeader::read_from(&mut self.input)?;
            if hdr.is_regular() {
                self.receive_regular(&hdr)?;
            } else if hdr.is_symlink() {
                self.receive_symlink(&hdr)?;
            } else {
                bail!(
                    "unexpected file mode {:o} for requested item {}",
                    hdr.mode,
                    index
                );
            }
            debug!("got file {} ({})", index, hdr.path.display());
            last = hdr.path;
        }
        self.send_status(0, &last)?;
        self.output.flush_frame()?;
        Ok(())
    }

    /// Stream the payload into a tempfile next to the target, then swap
    /// it in with a hard link. The target path itself is never opened,
    /// so a symlink planted there cannot redirect the write.
    fn receive_regular(&mut self, hdr: &FileHeader) -> Result<()> {
        self.check_transfer_size(hdr.file_len)?;
        self.total_bytes += hdr.file_len;

        let tmp = tempfile::Builder::new()
            .prefix("qsync-")
            .tempfile_in(self.snapshot_dir())
            .context("tempfile creation failed")?;
        let mut file = tmp.as_file();
        fsutil::copy_limited(&mut self.input, &mut file, hdr.file_len, &mut self.scratch)?;

        let local = self.local_path(&hdr.path);
        remove_if_exists(&local)?;
        fs::hard_link(tmp.path(), &local)
            .with_context(|| format!("unable to link file {}", local.display()))?;

        let atime_nsec = if self.opts.crc_mode.carries_crc(Phase::Content) {
            0
        } else {
            hdr.atime_nsec
        };
        apply_times_and_perms(hdr, &local, atime_nsec)
        // tmp drops here and unlinks the scratch entry
    }

    fn receive_symlink(&mut self, hdr: &FileHeader) -> Result<()> {
        if hdr.file_len > u64::from(MAX_PATH_LEN - 1) {
            bail!("symlink link-name too long ({} bytes)", hdr.file_len);
        }
        self.check_transfer_size(hdr.file_len)?;
        self.total_bytes += hdr.file_len;

        let mut buf = vec![0u8; hdr.file_len as usize];
        self.input
            .read_exact(&mut buf)
            .context("symlink content read failed")?;
        let target = PathBuf::from(std::ffi::OsString::from_vec(buf));

        let local = self.local_path(&hdr.path);
        remove_if_exists(&local)?;
        std::os::unix::fs::symlink(&target, &local)
            .with_context(|| format!("symlink {}", local.display()))?;
        // Times and perms cannot be set on symlinks; the metadata diff
        // skips them for the same reason.
        Ok(())
    }

    fn send_status(&mut self, code: u32, last: &Path) -> Result<()> {
        ResultHeader {
            error_code: code,
            crc32: 0,
        }
        .write_to(&mut self.output)?;
        ResultExt {
            last_name: last.to_path_buf(),
        }
        .write_to(&mut self.output)
        .context("failed sending result extension")?;
        Ok(())
    }

    /// Post-processing: everything the sender never mentioned goes away.
    /// Failures are logged, not fatal: the transfer itself already
    /// completed.
    fn delete_stale(&mut self) {
        for path in &self.to_delete {
            let md = match fs::symlink_metadata(path) {
                Ok(md) => md,
                // Typically removed together with a stale parent.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!("error during deletion of {}: {}", path.display(), e);
                    continue;
                }
            };
            let removed = if md.is_dir() {
                fs::remove_dir_all(path)
            } else {
                fs::remove_file(path)
            };
            match removed {
                Ok(()) => debug!("removed {}", path.display()),
                Err(e) => warn!("failed to delete {}: {}", path.display(), e),
            }
        }
    }
}

/// Error code for the result header: the underlying errno when there is
/// one (17 = existing file, and so on), EINVAL for protocol-shaped
/// failures.
fn error_code(err: &anyhow::Error) -> u32 {
    for cause in err.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if let Some(code) = io.raw_os_error() {
                return code as u32;
            }
        }
    }
    libc::EINVAL as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn handshake_bytes() -> Vec<u8> {
        let mut buf = Vec::new();
        VersionHeader {
            version: proto::VERSION,
            compression: 0,
            crc_usage: 0,
            verbosity: 0,
        }
        .write_to(&mut buf)
        .unwrap();
        buf
    }

    fn test_receiver(root: PathBuf, extra: &[u8]) -> Receiver<Cursor<Vec<u8>>, Vec<u8>> {
        let mut bytes = handshake_bytes();
        bytes.extend_from_slice(extra);
        Receiver::with_root(Cursor::new(bytes), Vec::new(), root).unwrap()
    }

    #[test]
    fn handshake_rejects_unknown_version() {
        let mut bytes = Vec::new();
        VersionHeader {
            version: 1,
            compression: 0,
            crc_usage: 0,
            verbosity: 0,
        }
        .write_to(&mut bytes)
        .unwrap();
        let err =
            Receiver::with_root(Cursor::new(bytes), Vec::new(), PathBuf::new()).unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
    }

    #[test]
    fn handshake_rejects_unknown_compression_and_crc() {
        let mut bytes = Vec::new();
        VersionHeader {
            version: 0,
            compression: 7,
            crc_usage: 0,
            verbosity: 0,
        }
        .write_to(&mut bytes)
        .unwrap();
        assert!(Receiver::with_root(Cursor::new(bytes), Vec::new(), PathBuf::new()).is_err());

        let mut bytes = Vec::new();
        VersionHeader {
            version: 0,
            compression: 0,
            crc_usage: 9,
            verbosity: 0,
        }
        .write_to(&mut bytes)
        .unwrap();
        assert!(Receiver::with_root(Cursor::new(bytes), Vec::new(), PathBuf::new()).is_err());
    }

    #[test]
    fn visit_stack_tracks_push_and_pop() {
        let tmp = tempfile::tempdir().unwrap();
        let mut r = test_receiver(tmp.path().to_path_buf(), &[]);

        assert!(r.visit_dir(Path::new("a")));
        assert!(r.visit_dir(Path::new("a/b")));
        assert!(!r.visit_dir(Path::new("a/b")));
        assert!(r.visit_dir(Path::new("a/c")));
        assert!(!r.visit_dir(Path::new("a/c")));
        assert!(!r.visit_dir(Path::new("a")));
        assert!(r.dir_stack.is_empty());
    }

    #[test]
    fn transfer_size_boundaries() {
        let tmp = tempfile::tempdir().unwrap();
        let mut r = test_receiver(tmp.path().to_path_buf(), &[]);

        assert!(r.check_transfer_size(MAX_TRANSFER).is_ok());
        assert!(r.check_transfer_size(MAX_TRANSFER + 1).is_err());

        r.set_limits(None, Some(100));
        r.total_bytes = 90;
        assert!(r.check_transfer_size(10).is_ok());
        assert!(r.check_transfer_size(11).is_err());
    }

    #[test]
    fn blacklist_trips_before_any_deletion() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join("etc")).unwrap();
        fs::write(tmp.path().join("stale.txt"), b"untouched").unwrap();

        let mut eot = Vec::new();
        proto::write_eot(&mut eot).unwrap();
        let mut r = test_receiver(tmp.path().to_path_buf(), &eot);
        let err = r.receive_metadata().unwrap_err();
        assert!(err.to_string().contains("bailing out"));
        assert!(tmp.path().join("stale.txt").exists());
        assert!(tmp.path().join("etc").exists());
    }

    #[test]
    fn unknown_metadata_type_is_a_protocol_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut bytes = Vec::new();
        FileHeader {
            name_len: 5,
            mode: 0o010644, // fifo
            file_len: 0,
            atime: 0,
            atime_nsec: 0,
            mtime: 0,
            mtime_nsec: 0,
            path: PathBuf::from("fifo"),
        }
        .write_to(&mut bytes)
        .unwrap();
        proto::write_eot(&mut bytes).unwrap();

        let mut r = test_receiver(tmp.path().to_path_buf(), &bytes);
        let err = r.receive_metadata().unwrap_err();
        assert!(format!("{err:#}").contains("unknown file mode"));
    }

    #[test]
    fn unbalanced_dir_visits_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut bytes = Vec::new();
        FileHeader {
            name_len: 4,
            mode: 0o040755,
            file_len: 0,
            atime: 0,
            atime_nsec: 0,
            mtime: 0,
            mtime_nsec: 0,
            path: PathBuf::from("top"),
        }
        .write_to(&mut bytes)
        .unwrap();
        proto::write_eot(&mut bytes).unwrap();

        let mut r = test_receiver(tmp.path().to_path_buf(), &bytes);
        let err = r.receive_metadata().unwrap_err();
        assert!(err.to_string().contains("unbalanced"));
    }

    #[test]
    fn error_codes_map_to_errno() {
        let io_err = std::io::Error::from_raw_os_error(libc::EEXIST);
        let err = anyhow::Error::from(io_err).context("linking failed");
        assert_eq!(error_code(&err), 17);

        let err = anyhow::anyhow!("expected NUL-terminated path");
        assert_eq!(error_code(&err), libc::EINVAL as u32);
    }
}
