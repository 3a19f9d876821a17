// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use bench_infra::{CancelToken, Connector, RemoteSession, SshEndpoint};
use log::{error, info, warn};
use serde::Serialize;
use storage_backend::StorageBackend;

use crate::config::{write_config, VmParams, VmTemplate};
use crate::images::{prepare_images, VmImages};
use crate::launcher::{Hypervisor, LaunchSpec};
use crate::readiness::{wait_for_guest_ready, ReadinessPolicy};
use crate::{Error, Result};

pub const QEMU_CONFIG_FILE: &str = "qemu.cfg";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum VmState {
    Created,
    ConfigWritten,
    ProcessLaunched,
    AwaitingSsh,
    Ready,
    Running,
    Completed,
    Failed,
    TornDown,
}

impl VmState {
    pub fn can_advance_to(self, next: VmState) -> bool {
        use VmState::*;
        match next {
            TornDown => true,
            Failed => !matches!(self, Completed | Failed | TornDown),
            _ => matches!(
                (self, next),
                (Created, ConfigWritten)
                    | (ConfigWritten, ProcessLaunched)
                    | (ProcessLaunched, AwaitingSsh)
                    | (AwaitingSsh, Ready)
                    | (Ready, Running)
                    | (Running, Completed)
            ),
        }
    }
}

/// Shared view of a VM state. Cloned into the workers that drive the
/// benchmark phase.
#[derive(Clone, Debug)]
pub struct StateCell(Arc<Mutex<VmState>>);

impl StateCell {
    fn new() -> Self {
        StateCell(Arc::new(Mutex::new(VmState::Created)))
    }

    pub fn get(&self) -> VmState {
        *self.0.lock().unwrap()
    }

    pub fn advance(&self, next: VmState) -> Result<()> {
        let mut state = self.0.lock().unwrap();
        if !state.can_advance_to(next) {
            return Err(Error::InvalidTransition {
                from: *state,
                to: next,
            });
        }
        *state = next;
        Ok(())
    }
}

/// Per-VM inputs of [`VmManager::start`].
#[derive(Clone, Debug)]
pub struct VmSpec {
    pub index: usize,
    pub port: u16,
    pub pool_size: usize,
    pub result_dir: PathBuf,
    pub template: VmTemplate,
    pub wwpn: Option<String>,
}

pub struct VirtualMachine {
    index: usize,
    port: u16,
    result_dir: PathBuf,
    endpoint: SshEndpoint,
    images: Option<VmImages>,
    storage: Option<StorageBackend>,
    session: Option<Arc<dyn RemoteSession>>,
    state: StateCell,
    cancel: CancelToken,
    supervisor: Option<JoinHandle<Result<()>>>,
}

impl VirtualMachine {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn result_dir(&self) -> &Path {
        &self.result_dir
    }

    pub fn endpoint(&self) -> &SshEndpoint {
        &self.endpoint
    }

    pub fn images(&self) -> Option<&VmImages> {
        self.images.as_ref()
    }

    pub fn state(&self) -> VmState {
        self.state.get()
    }

    pub fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    pub fn session(&self) -> Option<Arc<dyn RemoteSession>> {
        self.session.clone()
    }

    /// Token cancelled when the VM is torn down or its hypervisor exits.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn storage(&self) -> Option<&StorageBackend> {
        self.storage.as_ref()
    }

    pub fn attach_storage(&mut self, storage: StorageBackend) {
        self.storage = Some(storage);
    }

    /// Hands the storage over for release. Returns `None` once taken.
    pub fn take_storage(&mut self) -> Option<StorageBackend> {
        self.storage.take()
    }

    /// Waits for the supervisor once the VM token has fired and returns
    /// the hypervisor error, if any.
    fn launch_error(&mut self) -> Option<Error> {
        if !self.cancel.is_cancelled() {
            return None;
        }
        match self.supervisor.take()?.join() {
            Ok(Err(e)) => Some(e),
            _ => None,
        }
    }

    /// Stops the VM: closes the SSH session, cancels the VM token, waits
    /// for the hypervisor to go away and deletes private image copies.
    ///
    /// Storage is left attached for the caller to release. Calling this
    /// again is a no-op. Failures are logged and returned.
    pub fn shutdown(&mut self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.state.get() == VmState::TornDown {
            return errors;
        }

        if let Some(session) = self.session.take() {
            session.close();
        }
        self.cancel.cancel();

        if let Some(supervisor) = self.supervisor.take() {
            match supervisor.join() {
                Ok(Ok(())) => (),
                Ok(Err(e)) => warn!("VM localhost:{}: {e}", self.port),
                Err(_) => {
                    error!("Supervisor of VM localhost:{} panicked", self.port);
                    errors.push(format!("VM localhost:{}: supervisor panicked", self.port));
                }
            }
        }

        if let Some(images) = self.images.as_mut() {
            errors.extend(images.remove());
        }

        // TornDown is reachable from every state
        let _ = self.state.advance(VmState::TornDown);
        info!("VM localhost:{} torn down", self.port);
        errors
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(storage) = &self.storage {
            warn!(
                "VM localhost:{} dropped with storage {} still attached",
                self.port, storage.wwpn
            );
        }
    }
}

pub struct VmManager {
    hypervisor: Arc<dyn Hypervisor>,
    connector: Arc<dyn Connector>,
    readiness: ReadinessPolicy,
}

impl VmManager {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        connector: Arc<dyn Connector>,
        readiness: ReadinessPolicy,
    ) -> Self {
        VmManager {
            hypervisor,
            connector,
            readiness,
        }
    }

    /// Boots one VM and waits until its guest accepts SSH connections.
    ///
    /// The VM is bound to a child of `parent`. On failure everything
    /// started for it is stopped again before the error is returned.
    pub fn start(&self, spec: VmSpec, parent: &CancelToken) -> Result<VirtualMachine> {
        let mut vm = VirtualMachine {
            index: spec.index,
            port: spec.port,
            result_dir: spec.result_dir.clone(),
            endpoint: SshEndpoint::localhost(spec.port),
            images: None,
            storage: None,
            session: None,
            state: StateCell::new(),
            cancel: parent.child(),
            supervisor: None,
        };

        match self.bring_up(&mut vm, &spec) {
            Ok(()) => Ok(vm),
            Err(e) => {
                let _ = vm.state.advance(VmState::Failed);
                error!("Create VM with address localhost:{} failed: {e}", vm.port);
                vm.shutdown();
                Err(e)
            }
        }
    }

    fn bring_up(&self, vm: &mut VirtualMachine, spec: &VmSpec) -> Result<()> {
        let template = &spec.template;
        let images = prepare_images(
            &template.image,
            &template.seed_image,
            spec.index,
            spec.pool_size,
            &vm.cancel,
        )?;
        let launch = LaunchSpec {
            port: spec.port,
            config: spec.result_dir.join(QEMU_CONFIG_FILE),
            seed_image: images.seed.clone(),
            result_dir: spec.result_dir.clone(),
        };
        let params = VmParams {
            image: images.image.clone(),
            format: template.format.clone(),
            vcpus: template.vcpus,
            memory_mib: template.memory_mib,
            wwpn: spec.wwpn.clone(),
            run_dir: spec.result_dir.clone(),
        };
        vm.images = Some(images);

        write_config(&launch.config, &params)?;
        vm.state.advance(VmState::ConfigWritten)?;

        let hypervisor = self.hypervisor.clone();
        let cancel = vm.cancel.clone();
        let supervisor = thread::Builder::new()
            .name(format!("vm-{}", spec.port))
            .spawn(move || {
                let r = hypervisor.run(&launch, &cancel);
                // Nothing can use the VM once its hypervisor is gone
                cancel.cancel();
                r
            })
            .map_err(|source| Error::Supervisor {
                port: spec.port,
                source,
            })?;
        vm.supervisor = Some(supervisor);
        vm.state.advance(VmState::ProcessLaunched)?;
        info!("Created VM with address localhost:{}", spec.port);

        vm.state.advance(VmState::AwaitingSsh)?;
        match wait_for_guest_ready(
            self.connector.as_ref(),
            &vm.endpoint,
            &self.readiness,
            &vm.cancel,
        ) {
            Ok(session) => vm.session = Some(session),
            Err(e) => {
                // Report why the hypervisor died rather than the probe
                if let Some(launch_error) = vm.launch_error() {
                    return Err(launch_error);
                }
                return Err(e);
            }
        }

        vm.state.advance(VmState::Ready)
    }
}
