//! Filesystem management for container isolation.
//!
//! Provides `OverlayFS` layer composition, `/dev` population, `pivot_root`
//! for switching into the merged root, and mount utilities.

pub mod devices;
pub mod mount;
pub mod overlayfs;
pub mod pivot_root;
