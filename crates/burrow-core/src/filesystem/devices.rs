//! Population of a fresh `/dev` after the root switch.
//!
//! Device nodes cannot be created inside a user namespace, so the standard
//! character devices are bind mounted from the old root, which must still be
//! mounted when [`populate`] runs.

use std::os::unix::fs::symlink;
use std::path::Path;

use burrow_common::error::{BurrowError, Result};
use nix::mount::MsFlags;

use crate::filesystem::mount::{bind_mount, ensure_dir, ensure_file, mount_fs};

/// Character devices bind mounted from the host.
pub const BIND_DEVICES: &[&str] = &["null", "zero", "full", "random", "urandom", "tty"];

/// Symlinks created in `/dev`, as `(link, target)`.
pub const DEV_SYMLINKS: &[(&str, &str)] = &[
    ("fd", "/proc/self/fd"),
    ("stdin", "/proc/self/fd/0"),
    ("stdout", "/proc/self/fd/1"),
    ("stderr", "/proc/self/fd/2"),
];

/// Mounts a tmpfs on `dev` and fills it with the usual devices, pseudo
/// terminals, shared memory and message queues, sourcing device nodes from
/// `old_dev` (the host's `/dev` as seen through the old root).
///
/// # Errors
///
/// Returns an error on the first mount, directory or link that fails.
pub fn populate(dev: &Path, old_dev: &Path) -> Result<()> {
    // mode=755 keeps the sticky bit off, which would block writes to devices.
    mount_fs("tmpfs", dev, MsFlags::MS_NOSUID, Some("mode=755"))?;

    for (link, target) in DEV_SYMLINKS {
        make_symlink(target, &dev.join(link))?;
    }

    let shm = dev.join("shm");
    ensure_dir(&shm)?;
    mount_fs(
        "tmpfs",
        &shm,
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some("mode=1777"),
    )?;

    for name in BIND_DEVICES {
        let target = dev.join(name);
        ensure_file(&target)?;
        bind_mount(&old_dev.join(name), &target, false)?;
    }

    let mqueue = dev.join("mqueue");
    ensure_dir(&mqueue)?;
    mount_fs(
        "mqueue",
        &mqueue,
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None,
    )?;

    let pts = dev.join("pts");
    ensure_dir(&pts)?;
    mount_fs(
        "devpts",
        &pts,
        MsFlags::empty(),
        Some("newinstance,mode=620,ptmxmode=666,gid=5"),
    )?;
    make_symlink("pts/ptmx", &dev.join("ptmx"))?;

    let net = dev.join("net");
    ensure_dir(&net)?;
    let tun = net.join("tun");
    ensure_file(&tun)?;
    bind_mount(&old_dev.join("net/tun"), &tun, false)?;

    tracing::debug!(dev = %dev.display(), "device tree populated");
    Ok(())
}

fn make_symlink(target: &str, link: &Path) -> Result<()> {
    symlink(target, link).map_err(|e| BurrowError::io(link, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_devices_are_bound() {
        for dev in ["null", "zero", "urandom", "tty"] {
            assert!(BIND_DEVICES.contains(&dev), "{dev} missing");
        }
    }

    #[test]
    fn stdio_links_point_at_proc() {
        for (link, target) in DEV_SYMLINKS {
            assert!(target.starts_with("/proc/self/fd"), "{link} -> {target}");
        }
    }
}
