//! Wire records for the sync protocol.
//!
//! Every record is little-endian and packed. The session opens with a
//! version header on the raw (never compressed) transport; after that the
//! metadata phase is a sequence of file headers terminated by an all-zero
//! sentinel, answered by a result header + extension, a request list, the
//! replayed content, and a final result header + extension.

use std::ffi::OsString;
use std::fs::Metadata;
use std::io::{Read, Write};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

/// Only defined protocol version.
pub const VERSION: u16 = 0;

/// Maximum on-wire path length, including the NUL terminator.
pub const MAX_PATH_LEN: u32 = 16384;

/// Largest file the receiver accepts. The original qvm-copy allowed
/// LONG_MAX; 1 TB ought to suffice.
pub const MAX_TRANSFER: u64 = 1_000_000_000_000;

/// Fixed part of a file header.
pub const FILE_HEADER_LEN: usize = 32;

/// Size of the version header.
pub const VERSION_HEADER_LEN: usize = 19;

// Older protocols parse the first four bytes as a name length, so an
// all-ones preamble makes them reject the stream instead of walking off
// into garbage.
const ONES: u32 = u32::MAX;

/// Stream compression negotiated in the version header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    Off,
    Snappy,
}

impl Compression {
    pub fn from_wire(v: u16) -> Result<Self> {
        match v {
            0 => Ok(Compression::Off),
            1 => Ok(Compression::Snappy),
            _ => bail!("unsupported compression format {}", v),
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            Compression::Off => 0,
            Compression::Snappy => 1,
        }
    }
}

/// Which transfer phases carry a content CRC in the `atime_nsec` slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrcMode {
    /// `atime_nsec` is real nanoseconds everywhere.
    Off,
    /// CRC in both the metadata and the content phase; the receiver
    /// stamps atimes with zero nanoseconds.
    Full,
    /// CRC in the metadata phase only (the default); content-phase
    /// nanoseconds are real and used.
    MetadataOnly,
}

/// The two phases a file header can travel in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Metadata,
    Content,
}

impl CrcMode {
    pub fn from_wire(v: u16) -> Result<Self> {
        match v {
            0 => Ok(CrcMode::Off),
            1 => Ok(CrcMode::Full),
            2 => Ok(CrcMode::MetadataOnly),
            _ => bail!("unsupported crc usage: {}", v),
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            CrcMode::Off => 0,
            CrcMode::Full => 1,
            CrcMode::MetadataOnly => 2,
        }
    }

    /// Whether `atime_nsec` holds a CRC (rather than nanoseconds) during
    /// the given phase.
    pub fn carries_crc(self, phase: Phase) -> bool {
        match self {
            CrcMode::Off => false,
            CrcMode::Full => true,
            CrcMode::MetadataOnly => phase == Phase::Metadata,
        }
    }
}

/// One-shot handshake record, always sent uncompressed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VersionHeader {
    pub version: u16,
    pub compression: u16,
    pub crc_usage: u16,
    pub verbosity: u8,
}

impl VersionHeader {
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        let mut buf = [0u8; VERSION_HEADER_LEN];
        buf[0..4].copy_from_slice(&ONES.to_le_bytes());
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..8].copy_from_slice(&self.compression.to_le_bytes());
        buf[8..10].copy_from_slice(&self.crc_usage.to_le_bytes());
        buf[10] = self.verbosity;
        // bytes 11..19 reserved
        w.write_all(&buf)?;
        Ok(())
    }

    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; VERSION_HEADER_LEN];
        r.read_exact(&mut buf)?;
        let ones = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if ones != ONES {
            bail!("bad version preamble {:#010x}", ones);
        }
        Ok(VersionHeader {
            version: u16::from_le_bytes([buf[4], buf[5]]),
            compression: u16::from_le_bytes([buf[6], buf[7]]),
            crc_usage: u16::from_le_bytes([buf[8], buf[9]]),
            verbosity: buf[10],
        })
    }
}

/// Metadata for one directory entry. `mode` is the POSIX `st_mode` word;
/// `atime_nsec` may hold a content CRC depending on the session's
/// [`CrcMode`] and the phase the header travels in.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileHeader {
    pub name_len: u32,
    pub mode: u32,
    pub file_len: u64,
    pub atime: u32,
    pub atime_nsec: u32,
    pub mtime: u32,
    pub mtime_nsec: u32,
    pub path: PathBuf,
}

impl FileHeader {
    /// Build a header from an lstat result. Directory lengths are forced
    /// to zero: their on-disk size is filesystem trivia, not payload.
    pub fn from_metadata(path: &Path, md: &Metadata) -> Self {
        let file_len = if md.is_dir() { 0 } else { md.size() };
        FileHeader {
            name_len: path.as_os_str().len() as u32 + 1,
            mode: md.mode(),
            file_len,
            atime: md.atime() as u32,
            atime_nsec: md.atime_nsec() as u32,
            mtime: md.mtime() as u32,
            mtime_nsec: md.mtime_nsec() as u32,
            path: path.to_path_buf(),
        }
    }

    pub fn is_eot(&self) -> bool {
        self.name_len == 0
    }

    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFLNK
    }

    pub fn is_regular(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    /// Permission bits, including setuid/setgid/sticky.
    pub fn perm_bits(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        let mut buf = [0u8; FILE_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.name_len.to_le_bytes());
        buf[4..8].copy_from_slice(&self.mode.to_le_bytes());
        buf[8..16].copy_from_slice(&self.file_len.to_le_bytes());
        buf[16..20].copy_from_slice(&self.atime.to_le_bytes());
        buf[20..24].copy_from_slice(&self.atime_nsec.to_le_bytes());
        buf[24..28].copy_from_slice(&self.mtime.to_le_bytes());
        buf[28..32].copy_from_slice(&self.mtime_nsec.to_le_bytes());
        w.write_all(&buf)?;
        write_path(w, &self.path)
    }

    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; FILE_HEADER_LEN];
        r.read_exact(&mut buf)?;
        let name_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let path = read_path(r, name_len)?;
        Ok(FileHeader {
            name_len,
            mode: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            file_len: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
            atime: u32::from_le_bytes([buf[16], buf[17], buf[18], buf[19]]),
            atime_nsec: u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]),
            mtime: u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]),
            mtime_nsec: u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]),
            path,
        })
    }

    /// Field-by-field metadata comparison; returns one description per
    /// differing field. Atime is deliberately excluded: it is too
    /// volatile, and the nanosecond slot may carry a CRC. Mtime is
    /// skipped when both sides are symlinks, since link times cannot be
    /// restored and would mismatch forever.
    pub fn diff(&self, other: &FileHeader) -> Vec<String> {
        let mut diffs = Vec::new();
        if self.name_len != other.name_len {
            diffs.push(format!("name_len {} != {}", self.name_len, other.name_len));
        }
        if self.mode != other.mode {
            diffs.push(format!("mode {:o} != {:o}", self.mode, other.mode));
        }
        if self.file_len != other.file_len {
            diffs.push(format!("file_len {} != {}", self.file_len, other.file_len));
        }
        if !(self.is_symlink() && other.is_symlink()) {
            if self.mtime != other.mtime {
                diffs.push(format!("mtime {} != {}", self.mtime, other.mtime));
            }
            if self.mtime_nsec != other.mtime_nsec {
                diffs.push(format!(
                    "mtime_nsec {} != {}",
                    self.mtime_nsec, other.mtime_nsec
                ));
            }
        }
        diffs
    }
}

/// Write the end-of-transfer sentinel: a 32-byte all-zero file header.
pub fn write_eot<W: Write + ?Sized>(w: &mut W) -> Result<()> {
    w.write_all(&[0u8; FILE_HEADER_LEN])?;
    Ok(())
}

/// Per-phase acknowledgement. `crc32` is reserved on the wire and always
/// written as zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResultHeader {
    pub error_code: u32,
    pub crc32: u64,
}

impl ResultHeader {
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&self.error_code.to_le_bytes());
        // bytes 4..8 pad
        buf[8..16].copy_from_slice(&self.crc32.to_le_bytes());
        w.write_all(&buf)?;
        Ok(())
    }

    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; 16];
        r.read_exact(&mut buf)?;
        Ok(ResultHeader {
            error_code: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            crc32: u64::from_le_bytes([
                buf[8], buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15],
            ]),
        })
    }
}

/// Trails every [`ResultHeader`] with the last processed path, so the
/// peer can name the culprit on failure.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultExt {
    pub last_name: PathBuf,
}

impl ResultExt {
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        let bytes = self.last_name.as_os_str().as_bytes();
        let len: u32 = if bytes.is_empty() {
            0
        } else {
            bytes.len() as u32 + 1
        };
        w.write_all(&len.to_le_bytes())?;
        write_path(w, &self.last_name)
    }

    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> Result<Self> {
        let mut buf = [0u8; 4];
        r.read_exact(&mut buf)?;
        let len = u32::from_le_bytes(buf);
        Ok(ResultExt {
            last_name: read_path(r, len)?,
        })
    }
}

/// Write the receiver's request list: count, then the indices in
/// sender-emission order.
pub fn write_request_list<W: Write + ?Sized>(w: &mut W, list: &[u32]) -> Result<()> {
    w.write_all(&(list.len() as u32).to_le_bytes())?;
    for index in list {
        w.write_all(&index.to_le_bytes())?;
    }
    Ok(())
}

/// Read a request list, rejecting counts beyond what the sender emitted.
pub fn read_request_list<R: Read + ?Sized>(r: &mut R, max: u32) -> Result<Vec<u32>> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    let count = u32::from_le_bytes(buf);
    if count > max {
        bail!("remote requested {} items, only {} possible", count, max);
    }
    let mut list = Vec::with_capacity(count as usize);
    for _ in 0..count {
        r.read_exact(&mut buf)?;
        list.push(u32::from_le_bytes(buf));
    }
    Ok(list)
}

/// Read a NUL-terminated path of `len` bytes (terminator included).
pub fn read_path<R: Read + ?Sized>(r: &mut R, len: u32) -> Result<PathBuf> {
    if len > MAX_PATH_LEN {
        bail!("path too large ({} bytes)", len);
    }
    if len == 0 {
        return Ok(PathBuf::new());
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    if buf[len as usize - 1] != 0 {
        bail!("expected NUL-terminated path");
    }
    buf.pop();
    Ok(PathBuf::from(OsString::from_vec(buf)))
}

/// Write a path with a NUL suffix; the empty path writes nothing.
pub fn write_path<W: Write + ?Sized>(w: &mut W, path: &Path) -> Result<()> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() {
        return Ok(());
    }
    w.write_all(bytes)?;
    w.write_all(&[0])?;
    Ok(())
}
