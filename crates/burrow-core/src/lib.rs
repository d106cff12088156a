//! # burrow-core
//!
//! Low-level Linux isolation primitives for the burrow runtime.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: one-shot `unshare(2)` of the container's namespace set,
//!   user-namespace identity maps, and re-entry through a pidfd.
//! - **Filesystem**: `OverlayFS` planning and mounting, `/dev` population,
//!   bind mounts and `pivot_root`.
//! - **Network**: a minimal rtnetlink client (macvlan creation, addresses,
//!   routes) and a DHCP client running over a packet socket.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! `// SAFETY:` documentation.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod filesystem;
pub mod namespace;
pub mod net;
