//! `OverlayFS` composition of container layers.
//!
//! Layers are given bottom to top. The last one is the read-write layer;
//! layers below it that are still empty are skipped. With no non-empty lower
//! layer there is nothing to overlay and the read-write layer is simply bind
//! mounted onto its merged directory.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use burrow_common::error::{BurrowError, Result};
use nix::mount::MsFlags;

use crate::filesystem::mount::{bind_mount, ensure_dir, mount_fs};

/// Returns true when `dir` holds at least one entry besides `.` and `..`.
///
/// # Errors
///
/// Returns an error if the directory cannot be listed.
pub fn is_populated(dir: &Path) -> Result<bool> {
    let mut entries = std::fs::read_dir(dir).map_err(|e| BurrowError::io(dir, e))?;
    Ok(entries.next().is_some())
}

/// The mount derived from a container's layer stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayPlan {
    /// Read-only layers, most recent first.
    pub lower: Vec<PathBuf>,
    /// Writable layer.
    pub upper: PathBuf,
    /// Overlay scratch directory, next to `upper` on the same filesystem.
    pub work: PathBuf,
    /// Where the merged view is mounted.
    pub merged: PathBuf,
    /// Tmpfs mount point interposed above the persistent layers.
    pub ephemeral: Option<PathBuf>,
}

impl OverlayPlan {
    /// Derives the plan from `layers` (bottom to top, read-only), the
    /// read-write `upper` layer and, in ephemeral mode, the tmpfs mount point.
    ///
    /// `populated` decides whether a layer carries content; empty layers are
    /// left out of the lower chain.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer cannot be probed or a path cannot be
    /// expressed in overlay mount options.
    pub fn build(
        layers: &[PathBuf],
        upper: &Path,
        ephemeral: Option<&Path>,
        populated: impl Fn(&Path) -> Result<bool>,
    ) -> Result<Self> {
        let mut lower = Vec::new();
        for layer in layers {
            if populated(layer)? {
                lower.insert(0, layer.clone());
            } else {
                tracing::debug!(layer = %layer.display(), "skipping empty layer");
            }
        }

        let mut upper = upper.to_path_buf();
        if let Some(tmpfs) = ephemeral {
            if populated(&upper)? {
                lower.insert(0, upper);
            }
            upper = tmpfs.join("upper");
        }

        for path in lower.iter().chain([&upper]) {
            if path.to_string_lossy().contains(',') {
                return Err(BurrowError::Config {
                    message: format!("layer path cannot contain ',': {}", path.display()),
                });
            }
        }

        Ok(Self {
            work: suffixed(&upper, ":work"),
            merged: suffixed(&upper, ":merged"),
            lower,
            upper,
            ephemeral: ephemeral.map(Path::to_path_buf),
        })
    }

    /// Returns true when the merged view is a real overlay rather than a
    /// bind mount of the writable layer.
    #[must_use]
    pub fn is_overlay(&self) -> bool {
        !self.lower.is_empty()
    }

    /// Renders the `overlay` mount data.
    ///
    /// Colons inside lower layer paths are escaped because the lower chain
    /// is colon separated.
    #[must_use]
    pub fn mount_options(&self) -> String {
        let lower: Vec<String> = self
            .lower
            .iter()
            .map(|p| p.to_string_lossy().replace(':', "\\:"))
            .collect();
        format!(
            "lowerdir={},upperdir={},workdir={},xino=off,userxattr",
            lower.join(":"),
            self.upper.display(),
            self.work.display()
        )
    }

    /// Mounts the planned view and returns the merged directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created or a mount fails.
    pub fn mount(&self) -> Result<&Path> {
        if let Some(tmpfs) = &self.ephemeral {
            // Discarded when the mount namespace goes away.
            mount_fs("tmpfs", tmpfs, MsFlags::empty(), Some("mode=777"))?;
            ensure_dir(&self.upper)?;
        }
        ensure_dir(&self.merged)?;

        if self.is_overlay() {
            ensure_dir(&self.work)?;
            let options = self.mount_options();
            mount_fs("overlay", &self.merged, MsFlags::empty(), Some(&options))?;
            tracing::info!(
                merged = %self.merged.display(),
                lower = self.lower.len(),
                "overlay mounted"
            );
        } else {
            bind_mount(&self.upper, &self.merged, false)?;
            tracing::info!(merged = %self.merged.display(), "single layer bind mounted");
        }
        Ok(&self.merged)
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
