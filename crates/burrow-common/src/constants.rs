//! System-wide constants and default paths.

/// Application name used for data directories, runtime directories and
/// diagnostics.
pub const APP_NAME: &str = "burrow";

/// Binary name for the CLI.
pub const BIN_NAME: &str = "burrow";

/// Exit code used when the runtime itself fails, as opposed to mirroring
/// the contained process.
pub const FATAL_EXIT_CODE: i32 = 125;

/// Last-resort layer storage directory.
pub const SYSTEM_LAYER_DIR: &str = "/usr/local/share/burrow";

/// Fallback parent of the runtime directory when `$XDG_RUNTIME_DIR` is unset.
pub const FALLBACK_RUNTIME_PARENT: &str = "/tmp";

/// Subdirectory of the layer storage used as the tmpfs mount point in
/// ephemeral mode.
pub const EPHEMERAL_DIR: &str = "ephemeral";

/// Name of the macvlan interface created inside an isolated network namespace.
pub const MACVLAN_NAME: &str = "macvlan0";

/// Mount point of the old root inside the new root until it is detached.
pub const OLD_ROOT: &str = "/old_root";

/// Default `PATH` used for program lookup when the container environment
/// does not define one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Size of each per-direction relay buffer in the supervisor.
pub const RELAY_BUFFER_SIZE: usize = 1024;

/// Host input byte (`^]`, ASCII group separator) that forces the child down
/// when repeated [`INTERRUPT_REPEAT`] times in a row.
pub const INTERRUPT_BYTE: u8 = 0x1D;

/// Number of consecutive [`INTERRUPT_BYTE`]s that kill the child.
pub const INTERRUPT_REPEAT: usize = 3;

/// Seconds to wait for a DHCP answer before starting over.
pub const DHCP_RETRY_SECS: u64 = 30;

/// Host subordinate uid registry.
pub const SUBUID_PATH: &str = "/etc/subuid";

/// Host subordinate gid registry.
pub const SUBGID_PATH: &str = "/etc/subgid";

/// Resolver configuration path inside the container.
pub const RESOLV_CONF: &str = "/etc/resolv.conf";
