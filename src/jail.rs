//! Set-uid preloader support: stage the receiver binary inside the sync
//! jail and execute it there, chroot'd and demoted to the target user.
//!
//! Nothing in here speaks the wire protocol; this module only defines
//! the confinement the receiver runs under. Failures abort before the
//! exec, and resources already acquired are released by drop guards in
//! reverse acquisition order.

use std::fs;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, bail, Context, Result};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chown, chroot, setgroups, setresgid, setresuid, Gid, Uid, User};
use tracing::{debug, info, warn};

/// Account the receiver runs as.
pub const DEST_USER: &str = "user";

/// Base directory of the sync jail; the per-peer jail lives below it.
pub const DEST_ROOT: &str = "/home/user/QubesSync";

/// Removes the staged receiver binary when the session ends.
struct StagedBinary(PathBuf);

impl Drop for StagedBinary {
    fn drop(&mut self) {
        match fs::remove_file(&self.0) {
            Ok(()) => debug!("cleaned up {}", self.0.display()),
            Err(e) => warn!("failed cleaning up {}: {}", self.0.display(), e),
        }
    }
}

/// Lazily unmounts the jail bind mount when the session ends.
struct JailMount;

impl Drop for JailMount {
    fn drop(&mut self) {
        if let Err(e) = umount2(".", MntFlags::MNT_DETACH) {
            warn!("cannot unmount sync directory: {}", e);
        }
    }
}

/// Create `dir` as 0700 owned by `uid`/`gid` and change into it.
fn setup_dir(dir: &Path, uid: Uid, gid: Gid) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder
        .create(dir)
        .with_context(|| format!("mkdir {}", dir.display()))?;
    chown(dir, Some(uid), Some(gid))
        .with_context(|| format!("failed re-owning {} by {}", dir.display(), uid))?;
    std::env::set_current_dir(dir).context("failed chdir")?;
    Ok(())
}

/// Fresh name for the staged binary. Uniqueness within the 0700 jail is
/// all that matters here.
fn fresh_receiver_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = u64::from(std::process::id());
    format!("qsync-receive-temp-{:016x}", nanos ^ (pid << 32))
}

/// Run `trusted_binary` chroot'd into `<dest_root>/all` as `uname`, with
/// stdio inherited. Must be called with effective uid 0 (the set-uid
/// entry point guarantees it).
pub fn exec_jailed(uname: &str, dest_root: &Path, trusted_binary: &Path) -> Result<ExitStatus> {
    // Running set-uid means checking the effective uid, not the real one.
    let euid = Uid::effective();
    if !euid.is_root() {
        bail!("need root credentials, got {}", euid);
    }
    debug!("root ok");

    let user = User::from_name(uname)
        .with_context(|| format!("failed to lookup '{uname}'"))?
        .ok_or_else(|| anyhow!("no such user '{uname}'"))?;
    if user.uid == euid {
        bail!("same user alias forbidden");
    }

    let md = fs::metadata(trusted_binary)
        .with_context(|| format!("stat {} failed", trusted_binary.display()))?;
    if !md.is_file() {
        bail!("{} is not a regular file", trusted_binary.display());
    }

    setup_dir(dest_root, user.uid, user.gid)?;
    let jail = dest_root.join("all");
    setup_dir(&jail, user.uid, user.gid).context("jail setup failed")?;
    debug!("jail dir ok");

    let name = fresh_receiver_name();
    let staged_path = jail.join(&name);
    if let Err(e) = fs::hard_link(trusted_binary, &staged_path) {
        // Hard links cannot cross filesystem boundaries, such as
        // /usr/lib/qubes to /home/user.
        debug!("hard linking failed: {} - trying copy instead", e);
        fs::copy(trusted_binary, &staged_path).context("file copying failed")?;
    }
    let _staged = StagedBinary(staged_path.clone());
    // The target user must not be able to overwrite the binary.
    fs::set_permissions(&staged_path, fs::Permissions::from_mode(0o755))
        .context("chmod op failed")?;
    info!("staged receiver at {}", staged_path.display());

    std::env::set_current_dir(dest_root).context("failed chdir")?;
    mount(
        Some("."),
        ".",
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
        None::<&str>,
    )
    .context("failed mounting '.'")?;
    let _mount = JailMount;
    debug!("remount ok, executing receiver");

    let uid = user.uid;
    let gid = user.gid;
    let jail_root = jail.clone();
    let mut cmd = Command::new(format!("/{name}"));
    unsafe {
        cmd.pre_exec(move || {
            chroot(jail_root.as_path()).map_err(errno_to_io)?;
            std::env::set_current_dir("/")?;
            setgroups(&[gid]).map_err(errno_to_io)?;
            setresgid(gid, gid, gid).map_err(errno_to_io)?;
            setresuid(uid, uid, uid).map_err(errno_to_io)?;
            Ok(())
        });
    }
    let status = cmd
        .status()
        .with_context(|| format!("failed to run {} as user '{}'", name, uname))?;
    info!("execution complete: {status}");
    Ok(status)
}

fn errno_to_io(e: nix::errno::Errno) -> std::io::Error {
    std::io::Error::from_raw_os_error(e as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_names_are_fresh() {
        let a = fresh_receiver_name();
        let b = fresh_receiver_name();
        assert!(a.starts_with("qsync-receive-temp-"));
        assert_eq!(a.len(), "qsync-receive-temp-".len() + 16);
        assert_ne!(a, b);
    }

    #[test]
    fn refuses_to_run_unprivileged() {
        if Uid::effective().is_root() {
            // The privileged path needs a target user and a mount
            // namespace; exercised in deployment, not here.
            return;
        }
        let err = exec_jailed(DEST_USER, Path::new(DEST_ROOT), Path::new("/bin/true"))
            .unwrap_err();
        assert!(err.to_string().contains("need root credentials"));
    }
}
