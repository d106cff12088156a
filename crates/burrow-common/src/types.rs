//! Domain primitive types used across the burrow workspace.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BurrowError, Result};

/// Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// Returns the raw octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Returns true for the all-zero address, which the kernel treats as
    /// "pick one for me".
    #[must_use]
    pub fn is_unspecified(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl FromStr for MacAddr {
    type Err = BurrowError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || BurrowError::Config {
            message: format!("invalid MAC address: {s}"),
        };
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || part.len() > 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Network isolation request for a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Host interface the macvlan is attached to.
    pub parent: String,
    /// Hardware address for the macvlan. The kernel picks one when unset.
    pub mac: Option<MacAddr>,
    /// Nameserver written to the resolver configuration instead of the
    /// ones offered over DHCP.
    pub dns: Option<Ipv4Addr>,
}

/// A user-requested bind mount. `from` is a host path, `to` a path inside
/// the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Absolute host path.
    pub from: PathBuf,
    /// Absolute container path.
    pub to: PathBuf,
}

impl FromStr for BindMount {
    type Err = BurrowError;

    /// Parses `FROM[:TO]`. Without `TO` the source appears at the same path
    /// inside the container.
    fn from_str(s: &str) -> Result<Self> {
        let (from, to) = s.split_once(':').unwrap_or((s, s));
        let (from, to) = (PathBuf::from(from), PathBuf::from(to));
        if !from.is_absolute() || !to.is_absolute() {
            return Err(BurrowError::Config {
                message: format!("bind mounts must be absolute paths: {s}"),
            });
        }
        Ok(Self { from, to })
    }
}

/// Everything the engine needs to start one container. Built once from
/// external input and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Read-only layers, bottom to top.
    pub layers: Vec<PathBuf>,
    /// Read-write layer receiving the container's modifications.
    pub upper: PathBuf,
    /// Interpose a tmpfs above `upper` and discard it at exit.
    pub ephemeral: bool,
    /// Private network namespace with a macvlan and DHCP.
    pub network: Option<NetworkSpec>,
    /// Extra bind mounts applied after the root switch.
    pub binds: Vec<BindMount>,
    /// Directory to change into before executing the command.
    pub workdir: Option<PathBuf>,
    /// Command line of the contained program.
    pub command: Vec<String>,
    /// Environment of the contained program.
    pub env: Vec<(String, String)>,
    /// Container name: hostname, pid record key and config file name.
    pub name: Option<String>,
}

impl ContainerSpec {
    /// Checks the invariants the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns an error if the read-write layer or the command is missing.
    pub fn validate(&self) -> Result<()> {
        if self.upper.as_os_str().is_empty() {
            return Err(BurrowError::Config {
                message: "at least one overlay directory should be provided".into(),
            });
        }
        if self.command.is_empty() {
            return Err(BurrowError::Config {
                message: "no command to execute".into(),
            });
        }
        if let Some(name) = &self.name {
            if name.is_empty() || name.contains('/') {
                return Err(BurrowError::Config {
                    message: format!("invalid container name: {name:?}"),
                });
            }
        }
        Ok(())
    }

    /// Returns true when the container gets its own network namespace.
    #[must_use]
    pub const fn isolates_network(&self) -> bool {
        self.network.is_some()
    }
}

/// Parses a `KEY=VALUE` environment assignment.
///
/// # Errors
///
/// Returns an error if there is no `=` or the key is empty.
pub fn parse_env_pair(s: &str) -> Result<(String, String)> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(BurrowError::Config {
            message: format!("environment entries must look like FOO=BAR: {s}"),
        }),
    }
}
