//! Mount utilities for container filesystem setup.
//!
//! Every helper names the failing path in its error so setup failures are
//! diagnosable from the message alone.

use std::io::ErrorKind;
use std::path::Path;

use burrow_common::error::{BurrowError, Result};
use nix::mount::{MntFlags, MsFlags};

/// Marks every mount in the current namespace private, so nothing mounted
/// from here on propagates back to the host.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
pub fn make_private_recursive() -> Result<()> {
    nix::mount::mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| BurrowError::syscall("mount(/, MS_PRIVATE | MS_REC)", e))?;
    tracing::debug!("mount propagation made private");
    Ok(())
}

/// Mounts a pseudo filesystem (`tmpfs`, `proc`, `devpts`, ...) on `target`.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
pub fn mount_fs(fstype: &str, target: &Path, flags: MsFlags, data: Option<&str>) -> Result<()> {
    nix::mount::mount(Some("none"), target, Some(fstype), flags, data)
        .map_err(|e| BurrowError::syscall(format!("mount({fstype}, {})", target.display()), e))?;
    tracing::debug!(fstype, target = %target.display(), "mounted");
    Ok(())
}

/// Creates a bind mount from `source` to `target`.
///
/// # Errors
///
/// Returns an error if the `mount(2)` syscall fails.
pub fn bind_mount(source: &Path, target: &Path, recursive: bool) -> Result<()> {
    let mut flags = MsFlags::MS_BIND;
    if recursive {
        flags |= MsFlags::MS_REC;
    }
    nix::mount::mount(Some(source), target, None::<&str>, flags, None::<&str>).map_err(|e| {
        BurrowError::syscall(
            format!("bind({}, {})", source.display(), target.display()),
            e,
        )
    })?;
    tracing::debug!(source = %source.display(), target = %target.display(), "bind mounted");
    Ok(())
}

/// Lazily detaches the mount at `target`.
///
/// # Errors
///
/// Returns an error if the `umount2(2)` syscall fails.
pub fn detach(target: &Path) -> Result<()> {
    nix::mount::umount2(target, MntFlags::MNT_DETACH)
        .map_err(|e| BurrowError::syscall(format!("umount2({}, MNT_DETACH)", target.display()), e))
}

/// Creates a directory, tolerating one that already exists.
///
/// # Errors
///
/// Returns any other creation failure.
pub fn ensure_dir(path: &Path) -> Result<()> {
    match std::fs::create_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(BurrowError::io(path, e)),
    }
}

/// Creates an empty file to serve as a bind-mount target, keeping the
/// contents of one that already exists.
///
/// # Errors
///
/// Returns an error if the file cannot be opened for writing.
pub fn ensure_file(path: &Path) -> Result<()> {
    let _ = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(|e| BurrowError::io(path, e))?;
    Ok(())
}

/// Bind-mounts a user-requested `source` onto `target`, first creating a
/// target of the same kind (file or directory) as the source.
///
/// Failing to create the target is only a warning: it usually already
/// exists, and if it does not the mount itself reports the problem.
///
/// # Errors
///
/// Returns an error if the source cannot be inspected or the mount fails.
pub fn bind_user_path(source: &Path, target: &Path) -> Result<()> {
    let meta = std::fs::metadata(source).map_err(|e| BurrowError::io(source, e))?;
    let created = if meta.is_dir() {
        std::fs::create_dir(target)
    } else {
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(target)
            .map(drop)
    };
    if let Err(e) = created {
        if e.kind() != ErrorKind::AlreadyExists {
            tracing::warn!(target = %target.display(), error = %e, "could not create bind target");
        }
    }
    bind_mount(source, target, true)
}
