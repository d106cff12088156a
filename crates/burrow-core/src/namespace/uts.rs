//! UTS namespace isolation.
//!
//! Allows the container to have its own hostname.

use burrow_common::error::{BurrowError, Result};

/// Sets the hostname inside the UTS namespace.
///
/// # Errors
///
/// Returns an error if `sethostname(2)` fails.
pub fn set_hostname(hostname: &str) -> Result<()> {
    nix::unistd::sethostname(hostname)
        .map_err(|e| BurrowError::syscall(format!("sethostname({hostname})"), e))?;
    tracing::debug!(hostname, "container hostname set");
    Ok(())
}

/// Returns the current hostname.
///
/// # Errors
///
/// Returns an error if `gethostname(2)` fails.
pub fn hostname() -> Result<String> {
    let name = nix::unistd::gethostname().map_err(|e| BurrowError::syscall("gethostname", e))?;
    Ok(name.to_string_lossy().into_owned())
}
