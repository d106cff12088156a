//! The root switch.
//!
//! [`enter`] runs in the engine after the namespaces exist and leaves it
//! inside the merged root with a populated `/dev` and the host root still
//! reachable at [`OLD_ROOT`]. [`finish`] runs in the contained process, as
//! PID 1 of the new PID namespace, and completes the filesystem before the
//! program is executed.

use std::path::{Path, PathBuf};

use burrow_common::constants::{OLD_ROOT, RESOLV_CONF};
use burrow_common::error::{BurrowError, Result};
use burrow_common::types::{BindMount, ContainerSpec};
use burrow_core::filesystem::mount::{
    bind_mount, bind_user_path, ensure_dir, ensure_file, make_private_recursive, mount_fs,
};
use burrow_core::filesystem::overlayfs::OverlayPlan;
use burrow_core::filesystem::{devices, pivot_root};
use burrow_core::namespace::uts;
use burrow_core::net::macvlan;
use nix::mount::MsFlags;

/// Host files describing the network identity, bind mounted into containers
/// that share the host network.
pub const HOST_IDENTITY_FILES: &[&str] = &["/etc/hosts", "/etc/hostname", RESOLV_CONF];

/// Builds the root filesystem and pivots into it.
///
/// # Errors
///
/// Returns an error on the first mount, file or pivot that fails; the
/// namespace is unusable afterwards.
pub fn enter(spec: &ContainerSpec, plan: &OverlayPlan) -> Result<()> {
    make_private_recursive()?;
    let merged = plan.mount()?;

    if spec.isolates_network() {
        write_network_identity(merged, spec.name.as_deref())?;
    } else {
        bind_host_identity(merged)?;
    }

    let old_root = Path::new(OLD_ROOT);
    pivot_root::pivot_root(merged, old_root)?;
    devices::populate(Path::new("/dev"), &old_root.join("dev"))?;
    Ok(())
}

/// Mounts `/proc` and `/sys`, applies the user's bind mounts, drops the old
/// root and changes into the working directory.
///
/// # Errors
///
/// Returns an error on the first step that fails.
pub fn finish(spec: &ContainerSpec) -> Result<()> {
    let old_root = Path::new(OLD_ROOT);

    let proc = Path::new("/proc");
    ensure_dir(proc)?;
    mount_fs(
        "proc",
        proc,
        MsFlags::MS_NODEV | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        None,
    )?;
    mount_sys(old_root)?;

    for bind in &spec.binds {
        let (source, target) = bind_paths(old_root, bind);
        bind_user_path(&source, &target)?;
    }

    pivot_root::detach_old_root(old_root)?;

    if let Some(dir) = &spec.workdir {
        nix::unistd::chdir(dir.as_path())
            .map_err(|e| BurrowError::syscall(format!("chdir({})", dir.display()), e))?;
    }
    Ok(())
}

/// Where a bind mount is read from and mounted to once the root has been
/// switched: the host side is only reachable through the old root.
#[must_use]
pub fn bind_paths(old_root: &Path, bind: &BindMount) -> (PathBuf, PathBuf) {
    let host = bind.from.strip_prefix("/").unwrap_or(&bind.from);
    (old_root.join(host), bind.to.clone())
}

/// Contents of `/etc/hostname` in a networked container.
#[must_use]
pub fn render_hostname(hostname: &str) -> String {
    format!("{hostname}\n")
}

fn mount_sys(old_root: &Path) -> Result<()> {
    let sys = Path::new("/sys");
    ensure_dir(sys)?;
    let flags = MsFlags::MS_NODEV | MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC;
    match mount_fs("sysfs", sys, flags, None) {
        Ok(()) => {
            let cgroup = sys.join("fs/cgroup");
            mount_fs("cgroup2", &cgroup, flags, None)
        }
        Err(e) => {
            tracing::debug!(error = %e, "sysfs refused, binding the host's");
            bind_mount(&old_root.join("sys"), sys, true)
        }
    }
}

fn bind_host_identity(merged: &Path) -> Result<()> {
    for file in HOST_IDENTITY_FILES {
        let source = Path::new(file);
        if !source.exists() {
            tracing::debug!(file, "host file missing, not binding it");
            continue;
        }
        let target = merged.join(file.trim_start_matches('/'));
        if let Some(parent) = target.parent() {
            ensure_dir(parent)?;
        }
        ensure_file(&target)?;
        bind_mount(source, &target, false)?;
    }
    Ok(())
}

fn write_network_identity(merged: &Path, name: Option<&str>) -> Result<()> {
    let etc = merged.join("etc");
    ensure_dir(&etc)?;

    let hosts = etc.join("hosts");
    let _ = std::fs::copy("/etc/hosts", &hosts).map_err(|e| BurrowError::io(&hosts, e))?;

    let hostname = match name {
        Some(name) => {
            uts::set_hostname(name)?;
            name.to_string()
        }
        None => uts::hostname()?,
    };
    let hostname_file = etc.join("hostname");
    std::fs::write(&hostname_file, render_hostname(&hostname))
        .map_err(|e| BurrowError::io(hostname_file, e))?;

    macvlan::bring_loopback_up()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_source_is_read_through_the_old_root() {
        let bind: BindMount = "/srv/data:/data".parse().expect("bind");
        let (source, target) = bind_paths(Path::new(OLD_ROOT), &bind);
        assert_eq!(source, PathBuf::from("/old_root/srv/data"));
        assert_eq!(target, PathBuf::from("/data"));
    }

    #[test]
    fn hostname_file_ends_with_newline() {
        assert_eq!(render_hostname("web"), "web\n");
    }

    #[test]
    fn host_identity_includes_resolver_config() {
        assert!(HOST_IDENTITY_FILES.contains(&"/etc/resolv.conf"));
    }
}
