//! Macvlan attachment of a container to a host link.

use burrow_common::constants::MACVLAN_NAME;
use burrow_common::error::Result;
use burrow_common::types::MacAddr;
use nix::unistd::Pid;

use super::netlink::NetlinkHandle;

/// Creates `macvlan0` on top of the host link `parent`, directly inside the
/// network namespace of `target`.
///
/// Must run in the host network namespace, i.e. from the privilege helper.
///
/// # Errors
///
/// Returns an error if the parent link does not exist or the kernel refuses
/// the new link.
pub fn attach(parent: &str, target: Pid, mac: Option<MacAddr>) -> Result<()> {
    let mut nl = NetlinkHandle::new()?;
    let link = nl.link_info(parent)?;
    nl.create_macvlan(link.index, MACVLAN_NAME, target.as_raw(), mac)?;
    tracing::info!(parent, %target, "macvlan attached");
    Ok(())
}

/// Deletes the container's macvlan before its namespace is abandoned; the
/// kernel does not always clean it up when the last process exits.
///
/// Failures are logged and otherwise ignored.
pub fn teardown() {
    let result = NetlinkHandle::new().and_then(|mut nl| {
        let link = nl.link_info(MACVLAN_NAME)?;
        nl.delete_link(link.index)
    });
    match result {
        Ok(()) => tracing::debug!("macvlan removed"),
        Err(e) => tracing::warn!(error = %e, "could not remove {MACVLAN_NAME}"),
    }
}

/// Brings the loopback interface of the current namespace up.
///
/// # Errors
///
/// Returns an error if `lo` cannot be found or configured.
pub fn bring_loopback_up() -> Result<()> {
    let mut nl = NetlinkHandle::new()?;
    let lo = nl.link_info("lo")?;
    nl.set_up(lo.index)
}
