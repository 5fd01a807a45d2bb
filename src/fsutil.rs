//! Filesystem helpers shared by the sender and the receiver.

use std::fs::{self, File, Metadata};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use filetime::FileTime;

use crate::proto::FileHeader;

/// Scratch buffer size for checksumming and payload copies. Each session
/// owns one buffer and threads it through; nothing here is process-global.
pub const SCRATCH_LEN: usize = 64 * 1000;

/// CRC-32 (IEEE) of a regular file's content. Directories, symlinks and
/// empty files checksum to 0.
pub fn crc_file(path: &Path, md: &Metadata, scratch: &mut [u8]) -> Result<u32> {
    if !md.is_file() {
        return Ok(0);
    }
    let mut remaining = md.len();
    if remaining == 0 {
        return Ok(0);
    }
    let mut file =
        File::open(path).with_context(|| format!("crc failed for {}", path.display()))?;
    let mut hasher = crc32fast::Hasher::new();
    while remaining > 0 {
        let want = remaining.min(scratch.len() as u64) as usize;
        let n = file.read(&mut scratch[..want])?;
        if n == 0 {
            bail!("{}: short read while checksumming", path.display());
        }
        hasher.update(&scratch[..n]);
        remaining -= n as u64;
    }
    Ok(hasher.finalize())
}

/// Copy exactly `len` bytes from `input` to `output`. EOF short of `len`
/// is an error: the wire header already promised the full length.
pub fn copy_limited<R, W>(input: &mut R, output: &mut W, len: u64, scratch: &mut [u8]) -> Result<()>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut remaining = len;
    while remaining > 0 {
        let want = remaining.min(scratch.len() as u64) as usize;
        let n = input.read(&mut scratch[..want])?;
        if n == 0 {
            bail!("unexpected EOF with {} of {} bytes left", remaining, len);
        }
        output.write_all(&scratch[..n])?;
        remaining -= n as u64;
    }
    Ok(())
}

/// Remove whatever sits at `path`, if anything. Real directories go
/// recursively; symlink entries are unlinked without following.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    let md = match fs::symlink_metadata(path) {
        Ok(md) => md,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    };
    if md.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Stamp the permission bits (low 12 of `mode`) and atime/mtime from a
/// header. `atime_nsec` comes from the caller: the header slot holds a
/// CRC in some CRC-mode/phase combinations, in which case zero is passed.
/// Never called for symlinks, whose times and modes cannot be set.
pub fn apply_times_and_perms(hdr: &FileHeader, path: &Path, atime_nsec: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(hdr.perm_bits()))
        .with_context(|| format!("chmod {}", path.display()))?;
    let atime = FileTime::from_unix_time(i64::from(hdr.atime), atime_nsec);
    let mtime = FileTime::from_unix_time(i64::from(hdr.mtime), hdr.mtime_nsec);
    filetime::set_file_times(path, atime, mtime)
        .with_context(|| format!("set times on {}", path.display()))?;
    Ok(())
}
