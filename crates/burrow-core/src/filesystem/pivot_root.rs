//! Root filesystem switching via `pivot_root(2)`.

use std::path::Path;

use burrow_common::error::{BurrowError, Result};

use crate::filesystem::mount::{detach, ensure_dir};

/// Makes `new_root` the root of the mount namespace. The previous root
/// stays reachable at `old_root`, an absolute path inside the new root,
/// until [`detach_old_root`] is called.
///
/// # Errors
///
/// Returns an error if the mount point cannot be created or the
/// `pivot_root(2)` call fails.
pub fn pivot_root(new_root: &Path, old_root: &Path) -> Result<()> {
    let relative = old_root.strip_prefix("/").unwrap_or(old_root);
    let put_old = new_root.join(relative);
    ensure_dir(&put_old)?;

    nix::unistd::pivot_root(new_root, &put_old).map_err(|e| {
        BurrowError::syscall(
            format!("pivot_root({}, {})", new_root.display(), put_old.display()),
            e,
        )
    })?;
    nix::unistd::chdir("/").map_err(|e| BurrowError::syscall("chdir(/)", e))?;

    tracing::info!(new_root = %new_root.display(), "root pivoted");
    Ok(())
}

/// Lazily unmounts the previous root and removes its mount point.
///
/// # Errors
///
/// Returns an error if the unmount or the removal fails.
pub fn detach_old_root(old_root: &Path) -> Result<()> {
    detach(old_root)?;
    std::fs::remove_dir(old_root).map_err(|e| BurrowError::io(old_root, e))?;
    tracing::debug!(old_root = %old_root.display(), "old root detached");
    Ok(())
}
