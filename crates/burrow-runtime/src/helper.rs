//! The privilege helper.
//!
//! Identity maps and the macvlan must be installed from outside the new user
//! and network namespaces. Before the engine unshares, it forks a helper
//! that stays behind in the host namespaces and blocks on a pipe. Once the
//! namespaces exist, the engine sends a [`HelperRequest`] naming itself as
//! the target and waits for the helper to finish.

use std::io::{Read, Write};
use std::os::fd::OwnedFd;

use burrow_common::error::{BurrowError, Result};
use burrow_common::types::NetworkSpec;
use burrow_core::namespace::user::{CallerIdentity, map_identities};
use burrow_core::net::macvlan;
use nix::fcntl::OFlag;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use serde::{Deserialize, Serialize};

/// What the helper is asked to do on behalf of the target process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperRequest {
    /// Process whose namespaces are configured.
    pub target_pid: i32,
    /// Caller's effective uid on the host.
    pub uid: u32,
    /// Caller's effective gid on the host.
    pub gid: u32,
    /// Caller's login name, used to look up subordinate ranges.
    pub user: Option<String>,
    /// Macvlan to attach, when the target isolates its network.
    pub network: Option<NetworkSpec>,
}

impl HelperRequest {
    /// Builds a request for `target` on behalf of `caller`.
    #[must_use]
    pub fn new(target: Pid, caller: &CallerIdentity, network: Option<NetworkSpec>) -> Self {
        Self {
            target_pid: target.as_raw(),
            uid: caller.uid,
            gid: caller.gid,
            user: caller.user.clone(),
            network,
        }
    }

    fn caller(&self) -> CallerIdentity {
        CallerIdentity {
            uid: self.uid,
            gid: self.gid,
            user: self.user.clone(),
        }
    }

    /// Runs the request from the host namespaces.
    ///
    /// # Errors
    ///
    /// Returns an error if the identity maps cannot be written or the
    /// macvlan cannot be created.
    pub fn execute(&self) -> Result<()> {
        let target = Pid::from_raw(self.target_pid);
        map_identities(target, &self.caller())?;
        if let Some(net) = &self.network {
            macvlan::attach(&net.parent, target, net.mac)?;
        }
        Ok(())
    }
}

/// Parses the bytes received over the pipe. `None` means the writer went
/// away without sending anything.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid request.
pub fn decode_request(bytes: &[u8]) -> Result<Option<HelperRequest>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(bytes)?))
}

/// Handle on a forked helper waiting for its request.
#[derive(Debug)]
pub struct PrivilegeHelper {
    pid: Pid,
    channel: OwnedFd,
}

impl PrivilegeHelper {
    /// Forks the helper. Must be called before the namespaces are created.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe or the fork fails.
    pub fn spawn() -> Result<Self> {
        let (reader, writer) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| BurrowError::syscall("pipe2", e))?;

        // SAFETY: the engine is single-threaded at this point; the child only
        // reads the pipe, performs its request and exits.
        match unsafe { fork() }.map_err(|e| BurrowError::syscall("fork(helper)", e))? {
            ForkResult::Child => {
                drop(writer);
                std::process::exit(run_helper(reader));
            }
            ForkResult::Parent { child } => {
                drop(reader);
                tracing::debug!(helper = %child, "privilege helper spawned");
                Ok(Self {
                    pid: child,
                    channel: writer,
                })
            }
        }
    }

    /// Sends `request`, then waits for the helper to carry it out.
    ///
    /// # Errors
    ///
    /// Returns [`BurrowError::Helper`] if the helper does not exit cleanly.
    pub fn complete(self, request: &HelperRequest) -> Result<()> {
        let payload = serde_json::to_vec(request)?;
        let Self { pid, channel } = self;
        let mut pipe = std::fs::File::from(channel);
        pipe.write_all(&payload)
            .map_err(|e| BurrowError::syscall("write(helper)", e))?;
        drop(pipe);

        match waitpid(pid, None).map_err(|e| BurrowError::syscall("waitpid(helper)", e))? {
            WaitStatus::Exited(_, 0) => {
                tracing::debug!(helper = %pid, "privilege helper done");
                Ok(())
            }
            status => Err(BurrowError::Helper {
                message: format!("unexpected helper status: {status:?}"),
            }),
        }
    }
}

fn run_helper(reader: OwnedFd) -> i32 {
    let mut bytes = Vec::new();
    if let Err(e) = std::fs::File::from(reader).read_to_end(&mut bytes) {
        tracing::error!(error = %e, "privilege helper could not read its request");
        return 1;
    }
    let request = match decode_request(&bytes) {
        Ok(Some(request)) => request,
        Ok(None) => return 1,
        Err(e) => {
            tracing::error!(error = %e, "privilege helper received a malformed request");
            return 1;
        }
    };
    match request.execute() {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "privilege helper failed");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caller() -> CallerIdentity {
        CallerIdentity {
            uid: 1000,
            gid: 100,
            user: Some("ada".into()),
        }
    }

    #[test]
    fn request_survives_the_pipe() {
        let network = NetworkSpec {
            parent: "eth0".into(),
            mac: Some("02:00:00:00:00:01".parse().expect("mac")),
            dns: None,
        };
        let request = HelperRequest::new(Pid::from_raw(321), &caller(), Some(network));
        let bytes = serde_json::to_vec(&request).expect("encode");
        assert_eq!(decode_request(&bytes).expect("decode"), Some(request));
    }

    #[test]
    fn closed_pipe_means_no_request() {
        assert_eq!(decode_request(b"").expect("decode"), None);
        assert!(decode_request(b"{\"target_pid\":").is_err());
    }

    #[test]
    fn request_carries_the_caller() {
        let request = HelperRequest::new(Pid::from_raw(9), &caller(), None);
        assert_eq!(request.caller(), caller());
        assert_eq!(request.target_pid, 9);
    }
}
