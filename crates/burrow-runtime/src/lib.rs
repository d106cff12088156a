//! Container lifecycle management for the burrow runtime.
//!
//! [`container::start`] builds a container from a [`ContainerSpec`] and
//! supervises its process until it exits; [`exec::join`] attaches a new
//! supervised process to a running named container. Both return the
//! [`ExitDisposition`] the caller is expected to mirror.
//!
//! [`ContainerSpec`]: burrow_common::types::ContainerSpec
//! [`ExitDisposition`]: supervisor::exit::ExitDisposition

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod container;
pub mod exec;
pub mod helper;
pub mod process;
pub mod rootfs;
pub mod state;
pub mod supervisor;
