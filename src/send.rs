//! Sender: the metadata walk and the content replay.
//!
//! Four strictly sequential phases, each flushed before the next read so
//! a compressed stream can never deadlock: walk the tree emitting
//! headers, await the receiver's ack, replay every requested index with
//! full header + payload, await the final ack.

use std::fs::{self, Metadata};
use std::io::{self, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, trace};

use crate::fsutil::{self, crc_file, SCRATCH_LEN};
use crate::proto::{
    self, Compression, FileHeader, Phase, ResultExt, ResultHeader, VersionHeader,
};
use crate::stream::{StreamReader, StreamWriter};
use crate::Options;

pub struct Sender<R: Read, W: Write> {
    input: StreamReader<R>,
    output: StreamWriter<W>,

    /// Relative paths of every requestable item, in emission order. The
    /// receiver's request indices point into this list.
    send_list: Vec<PathBuf>,

    /// Parent of the sync root; all emitted names are relative to it.
    root: PathBuf,

    opts: Options,
    scratch: Vec<u8>,
}

impl<R: Read, W: Write> Sender<R, W> {
    /// Writes the version header on the raw transport, then wraps both
    /// directions according to the announced options.
    pub fn new(mut output: W, input: R, opts: Options) -> Result<Self> {
        VersionHeader {
            version: proto::VERSION,
            compression: opts.compression.to_wire(),
            crc_usage: opts.crc_mode.to_wire(),
            verbosity: opts.verbosity,
        }
        .write_to(&mut output)?;

        let compressed = opts.compression == Compression::Snappy;
        Ok(Sender {
            input: StreamReader::new(input, compressed),
            output: StreamWriter::new(output, compressed),
            send_list: Vec::new(),
            root: PathBuf::new(),
            opts,
            scratch: vec![0u8; SCRATCH_LEN],
        })
    }

    /// Run a full session against the receiver on the other end.
    pub fn sync(&mut self, dir: &Path) -> Result<()> {
        self.transmit_directory(dir)
            .context("metadata send failed")?;
        self.wait_for_result().context("metadata ack failed")?;
        self.handle_request_list()
            .context("content replay failed")?;
        self.wait_for_result().context("content ack failed")?;
        let (raw, compressed) = self.output.stats();
        info!("data sent, raw: {raw}, compressed: {compressed}");
        Ok(())
    }

    /// Phase 0: emit metadata for the whole tree under `dir`, then the
    /// end-of-transfer sentinel.
    fn transmit_directory(&mut self, dir: &Path) -> Result<()> {
        let abs = std::path::absolute(dir)
            .with_context(|| format!("resolving {}", dir.display()))?;
        let leaf = match abs.file_name() {
            Some(name) => PathBuf::from(name),
            None => bail!("{} has no directory name", dir.display()),
        };
        let root = match abs.parent() {
            Some(parent) => parent.to_path_buf(),
            None => bail!("cannot sync the filesystem root"),
        };
        debug!("root: {}, sync dir: {}", root.display(), leaf.display());

        let md = fs::symlink_metadata(&abs)
            .with_context(|| format!("stat {}", abs.display()))?;
        if !md.is_dir() {
            bail!("{} is not a directory", dir.display());
        }
        self.root = root;
        self.walk(&leaf, &md)?;

        trace!("sending end-of-transfer");
        proto::write_eot(&mut self.output)?;
        self.output.flush_frame()?;
        let (raw, compressed) = self.output.stats();
        debug!("metadata sent, raw: {raw}, compressed: {compressed}");
        Ok(())
    }

    /// Depth-first walk. Directories are emitted once on the way down
    /// and, with a fresh stat, again on the way out, so the receiver can
    /// stamp them after their children exist.
    fn walk(&mut self, rel: &Path, md: &Metadata) -> Result<()> {
        if self.opts.ignore_symlinks && md.file_type().is_symlink() {
            return Ok(());
        }
        trace!("sending metadata for {}", rel.display());
        self.send_item_metadata(rel, md)?;
        if !md.is_dir() {
            return Ok(());
        }

        let full = self.root.join(rel);
        let mut entries = fs::read_dir(&full)
            .with_context(|| format!("read dir {}", full.display()))?
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());
        for entry in entries {
            let child = rel.join(entry.file_name());
            // DirEntry::metadata does not traverse symlinks.
            let child_md = entry.metadata()?;
            self.walk(&child, &child_md)?;
        }

        trace!("sending metadata (2) for {}", rel.display());
        let md = fs::symlink_metadata(&full)?;
        self.send_item_metadata(rel, &md)
    }

    fn send_item_metadata(&mut self, rel: &Path, md: &Metadata) -> Result<()> {
        let mut hdr = FileHeader::from_metadata(rel, md);
        if self.opts.crc_mode.carries_crc(Phase::Metadata) {
            // The slot is a checksum now, for every entry: regular files
            // carry their content CRC, directories and symlinks carry 0.
            hdr.atime_nsec = if hdr.is_regular() {
                crc_file(&self.root.join(rel), md, &mut self.scratch)?
            } else {
                0
            };
        }
        hdr.write_to(&mut self.output)?;
        if hdr.is_regular() || hdr.is_symlink() {
            self.send_list.push(rel.to_path_buf());
        }
        Ok(())
    }

    /// Phases 1 and 3: block on the receiver's result header + extension.
    fn wait_for_result(&mut self) -> Result<()> {
        let hdr = ResultHeader::read_from(&mut self.input)?;
        let ext = ResultExt::read_from(&mut self.input)?;
        if hdr.error_code != 0 {
            bail!(
                "sync error, code {}, last file {}",
                hdr.error_code,
                ext.last_name.display()
            );
        }
        debug!("got result ack, last file {}", ext.last_name.display());
        Ok(())
    }

    /// Phase 2: replay each requested index with full header + payload.
    fn handle_request_list(&mut self) -> Result<()> {
        let list = proto::read_request_list(&mut self.input, self.send_list.len() as u32)?;
        debug!("got list, {} items requested", list.len());
        for index in list {
            self.send_item(index)?;
        }
        self.output.flush_frame()?;
        Ok(())
    }

    fn send_item(&mut self, index: u32) -> Result<()> {
        let rel = match self.send_list.get(index as usize) {
            Some(rel) => rel.clone(),
            None => bail!(
                "index {} not in list (length {})",
                index,
                self.send_list.len()
            ),
        };
        let full = self.root.join(&rel);
        let md = fs::symlink_metadata(&full)
            .with_context(|| format!("file {} no longer available", rel.display()))?;
        debug!("sending file {}", rel.display());

        let mut hdr = FileHeader::from_metadata(&rel, &md);
        if hdr.is_regular() && self.opts.crc_mode.carries_crc(Phase::Content) {
            hdr.atime_nsec = crc_file(&full, &md, &mut self.scratch)?;
        }
        hdr.write_to(&mut self.output)?;

        if hdr.is_symlink() {
            let target = fs::read_link(&full)?;
            self.output.write_all(target.as_os_str().as_bytes())?;
        } else if hdr.is_regular() {
            let mut file = fs::File::open(&full)?;
            // Exactly file_len bytes: the header already went out, and
            // the receiver counts on it.
            fsutil::copy_limited(&mut file, &mut self.output, hdr.file_len, &mut self.scratch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::CrcMode;
    use filetime::FileTime;
    use std::io::Cursor;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::{Arc, Mutex};

    /// Sink that stays observable while the sender owns it.
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn plain_opts() -> Options {
        Options {
            compression: Compression::Off,
            crc_mode: CrcMode::Off,
            ..Options::default()
        }
    }

    fn set_times(path: &Path, secs: i64, nanos: u32) {
        filetime::set_file_times(
            path,
            FileTime::from_unix_time(secs, nanos),
            FileTime::from_unix_time(secs, nanos),
        )
        .unwrap();
    }

    #[test]
    fn walk_emits_double_visits_and_sentinel() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("syncroot");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("afile.txt"), b"hello world\n").unwrap();
        fs::set_permissions(root.join("afile.txt"), fs::Permissions::from_mode(0o644)).unwrap();
        std::os::unix::fs::symlink("afile.txt", root.join("blink")).unwrap();
        set_times(&root.join("afile.txt"), 1_573_986_295, 594_607_232);

        let sink = Shared::default();
        let mut sender = Sender::new(sink.clone(), io::empty(), plain_opts()).unwrap();
        sender.transmit_directory(&root).unwrap();

        let bytes = sink.0.lock().unwrap().clone();
        let mut cur = Cursor::new(bytes);

        let v = VersionHeader::read_from(&mut cur).unwrap();
        assert_eq!(v.version, proto::VERSION);
        assert_eq!(v.compression, 0);

        // dir (first), afile, blink, dir (second), EOT, with children in
        // name order, directories visited twice with identical paths.
        let first = FileHeader::read_from(&mut cur).unwrap();
        assert!(first.is_dir());
        assert_eq!(first.path, PathBuf::from("syncroot"));
        assert_eq!(first.file_len, 0);

        let file = FileHeader::read_from(&mut cur).unwrap();
        assert!(file.is_regular());
        assert_eq!(file.path, PathBuf::from("syncroot/afile.txt"));
        assert_eq!(file.file_len, 12);
        assert_eq!(file.mode & 0o7777, 0o644);
        assert_eq!(file.mtime, 1_573_986_295);
        assert_eq!(file.mtime_nsec, 594_607_232);

        let link = FileHeader::read_from(&mut cur).unwrap();
        assert!(link.is_symlink());
        assert_eq!(link.path, PathBuf::from("syncroot/blink"));
        assert_eq!(link.file_len, 9); // strlen("afile.txt")

        let second = FileHeader::read_from(&mut cur).unwrap();
        assert!(second.is_dir());
        assert_eq!(second.path, first.path);

        let eot = FileHeader::read_from(&mut cur).unwrap();
        assert!(eot.is_eot());
        assert_eq!(cur.position(), cur.get_ref().len() as u64);

        // No payload bytes in the metadata phase; indices 0 and 1 were
        // assigned to the requestables only.
        assert_eq!(
            sender.send_list,
            vec![
                PathBuf::from("syncroot/afile.txt"),
                PathBuf::from("syncroot/blink"),
            ]
        );
    }

    #[test]
    fn walk_skips_symlinks_when_told_to() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("kept"), b"data").unwrap();
        std::os::unix::fs::symlink("kept", root.join("skipped")).unwrap();

        let sink = Shared::default();
        let mut opts = plain_opts();
        opts.ignore_symlinks = true;
        let mut sender = Sender::new(sink.clone(), io::empty(), opts).unwrap();
        sender.transmit_directory(&root).unwrap();

        assert_eq!(sender.send_list, vec![PathBuf::from("tree/kept")]);
        let bytes = sink.0.lock().unwrap().clone();
        let mut cur = Cursor::new(bytes);
        VersionHeader::read_from(&mut cur).unwrap();
        let mut headers = Vec::new();
        loop {
            let hdr = FileHeader::read_from(&mut cur).unwrap();
            if hdr.is_eot() {
                break;
            }
            headers.push(hdr.path);
        }
        assert_eq!(
            headers,
            vec![
                PathBuf::from("tree"),
                PathBuf::from("tree/kept"),
                PathBuf::from("tree"),
            ]
        );
    }

    #[test]
    fn metadata_crc_lands_in_atime_nsec() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("afile"), b"hello world\n").unwrap();
        std::os::unix::fs::symlink("afile", root.join("blink")).unwrap();

        let sink = Shared::default();
        let mut opts = plain_opts();
        opts.crc_mode = CrcMode::MetadataOnly;
        let mut sender = Sender::new(sink.clone(), io::empty(), opts).unwrap();
        sender.transmit_directory(&root).unwrap();

        let bytes = sink.0.lock().unwrap().clone();
        let mut cur = Cursor::new(bytes);
        VersionHeader::read_from(&mut cur).unwrap();

        // Regular files carry their content CRC; directories and
        // symlinks carry 0, never their real atime nanoseconds.
        let dir = FileHeader::read_from(&mut cur).unwrap();
        assert!(dir.is_dir());
        assert_eq!(dir.atime_nsec, 0);
        let file = FileHeader::read_from(&mut cur).unwrap();
        assert_eq!(file.atime_nsec, crc32fast::hash(b"hello world\n"));
        let link = FileHeader::read_from(&mut cur).unwrap();
        assert!(link.is_symlink());
        assert_eq!(link.atime_nsec, 0);
        let second = FileHeader::read_from(&mut cur).unwrap();
        assert!(second.is_dir());
        assert_eq!(second.atime_nsec, 0);
    }

    #[test]
    fn non_directory_root_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("plain");
        fs::write(&file, b"x").unwrap();

        let mut sender = Sender::new(Shared::default(), io::empty(), plain_opts()).unwrap();
        let err = sender.transmit_directory(&file).unwrap_err();
        assert!(err.to_string().contains("not a directory"));
    }
}
