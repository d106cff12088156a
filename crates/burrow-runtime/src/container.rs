//! Starting a container.

use std::path::PathBuf;

use burrow_common::config::RuntimeConfig;
use burrow_common::error::Result;
use burrow_common::types::ContainerSpec;
use burrow_core::filesystem::overlayfs::{OverlayPlan, is_populated};
use burrow_core::namespace::NamespaceSet;
use burrow_core::namespace::user::CallerIdentity;
use burrow_core::net::macvlan;

use crate::helper::{HelperRequest, PrivilegeHelper};
use crate::process::{self, ReadyGate};
use crate::rootfs;
use crate::state::RecordDir;
use crate::supervisor::exit::ExitDisposition;
use crate::supervisor::network::Network;
use crate::supervisor::{self, terminal};

/// Derives the overlay plan for `spec` under `config`.
///
/// # Errors
///
/// Returns an error if a layer cannot be probed or named in mount options.
pub fn plan_overlay(spec: &ContainerSpec, config: &RuntimeConfig) -> Result<OverlayPlan> {
    let ephemeral: Option<PathBuf> = spec.ephemeral.then(|| config.ephemeral_dir());
    OverlayPlan::build(&spec.layers, &spec.upper, ephemeral.as_deref(), is_populated)
}

/// Creates the container described by `spec`, runs its command under
/// supervision and returns how it ended.
///
/// # Errors
///
/// Returns an error if any setup step fails or supervision breaks down.
pub fn start(spec: &ContainerSpec, config: &RuntimeConfig) -> Result<ExitDisposition> {
    spec.validate()?;
    config.ensure_layer_dir()?;
    let plan = plan_overlay(spec, config)?;
    let records = spec
        .name
        .as_ref()
        .map(|_| RecordDir::open(&config.runtime_dir))
        .transpose()?;
    let caller = CallerIdentity::current();

    let helper = PrivilegeHelper::spawn()?;
    let namespaces = NamespaceSet::new(spec.isolates_network());
    namespaces.unshare()?;
    helper.complete(&HelperRequest::new(
        nix::unistd::getpid(),
        &caller,
        spec.network.clone(),
    ))?;

    rootfs::enter(spec, &plan)?;

    let terminal = terminal::capture()?;
    let mut gate = spec.isolates_network().then(ReadyGate::new).transpose()?;
    let child = process::spawn(terminal.as_ref(), || {
        rootfs::finish(spec)?;
        if let Some(gate) = gate.take() {
            gate.wait()?;
        }
        process::exec(&spec.command, &spec.env)
    })?;

    let record = match (records, &spec.name) {
        (Some(dir), Some(name)) => Some(dir.write(name, child.pid)?),
        _ => None,
    };
    let network = match (gate, &spec.network) {
        (Some(gate), Some(net)) => Some(Network::start(
            spec.name.clone(),
            net.dns,
            gate.into_opener(),
        )?),
        _ => None,
    };

    let exit = supervisor::supervise(child, terminal.as_ref(), network);
    drop(record);
    if spec.isolates_network() {
        macvlan::teardown();
    }
    exit
}
