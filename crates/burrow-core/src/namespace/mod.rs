//! Linux namespace management for container isolation.
//!
//! A container's namespaces are created in one `unshare(2)` call and later
//! re-entered in one `setns(2)` call on a pidfd.

pub mod pidfd;
pub mod user;
pub mod uts;

use std::os::unix::fs::MetadataExt;
use std::path::Path;

use burrow_common::error::{BurrowError, Result};
use nix::sched::CloneFlags;
use nix::unistd::Pid;

/// The set of namespaces a container process owns.
///
/// Mount, cgroup, IPC, user and PID namespaces are always private; network
/// and UTS are added together when network isolation is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceSet {
    network: bool,
}

impl NamespaceSet {
    /// Namespaces for a new container.
    #[must_use]
    pub const fn new(isolate_network: bool) -> Self {
        Self {
            network: isolate_network,
        }
    }

    /// The namespaces owned by the running container process `pid`: the
    /// base set, plus network and UTS when its network namespace is not the
    /// caller's own.
    ///
    /// # Errors
    ///
    /// Returns an error if either namespace link cannot be inspected, which
    /// usually means the process is gone.
    pub fn of_process(pid: Pid) -> Result<Self> {
        let theirs = namespace_id(&Path::new("/proc").join(pid.to_string()).join("ns/net"))?;
        let ours = namespace_id(Path::new("/proc/self/ns/net"))?;
        Ok(Self::new(theirs != ours))
    }

    /// Returns true when network and UTS namespaces are part of the set.
    #[must_use]
    pub const fn isolates_network(&self) -> bool {
        self.network
    }

    /// Clone flags for `unshare(2)` / `setns(2)`.
    #[must_use]
    pub fn flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWCGROUP
            | CloneFlags::CLONE_NEWIPC
            | CloneFlags::CLONE_NEWUSER
            | CloneFlags::CLONE_NEWPID;
        if self.network {
            flags |= CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWUTS;
        }
        flags
    }

    /// Moves the calling process into fresh namespaces.
    ///
    /// The caller itself stays in its PID namespace; its next child becomes
    /// PID 1 of the new one.
    ///
    /// # Errors
    ///
    /// Returns an error if the `unshare(2)` syscall fails.
    pub fn unshare(&self) -> Result<()> {
        nix::sched::unshare(self.flags()).map_err(|e| BurrowError::syscall("unshare", e))?;
        tracing::debug!(network = self.network, "namespaces created");
        Ok(())
    }
}

/// Identity of a namespace: device and inode of its `/proc` link target.
fn namespace_id(link: &Path) -> Result<(u64, u64)> {
    let meta = std::fs::metadata(link).map_err(|e| BurrowError::io(link, e))?;
    Ok((meta.dev(), meta.ino()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_set_excludes_network_and_uts() {
        let flags = NamespaceSet::new(false).flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUSER));
        assert!(flags.contains(CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWCGROUP));
        assert!(!flags.intersects(CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWUTS));
    }

    #[test]
    fn network_isolation_adds_net_and_uts_together() {
        let flags = NamespaceSet::new(true).flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWNET | CloneFlags::CLONE_NEWUTS));
    }

    #[test]
    fn own_process_shares_our_network() {
        let ns = NamespaceSet::of_process(nix::unistd::getpid()).expect("inspect self");
        assert!(!ns.isolates_network());
    }
}
