// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bench_infra::CancelToken;
use log::{info, warn};
use serde::Serialize;
use storage_backend::{StorageProvisioner, VolumeRequest};
use vm_manager::{VirtualMachine, VmManager, VmSpec};

use crate::config::{RunConfig, StorageConfig};
use crate::{Error, Result};

/// Teardown failures. Collected and logged, never fatal.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub errors: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn extend<I: IntoIterator<Item = String>>(&mut self, errors: I) {
        self.errors.extend(errors);
    }

    fn push(&mut self, error: String) {
        warn!("Teardown: {error}");
        self.errors.push(error);
    }
}

/// Pool level storage created by the run: the ZFS pool or LVM volume group.
struct SharedStorage {
    pool: String,
    device: PathBuf,
}

/// The VMs of a run and the storage they stand on.
///
/// Teardown releases everything the pool owns and can be repeated; it
/// also runs when the pool is dropped.
pub struct Pool {
    vms: Vec<VirtualMachine>,
    provisioner: Option<Arc<dyn StorageProvisioner>>,
    shared: Option<SharedStorage>,
}

impl Pool {
    pub fn new(provisioner: Option<Arc<dyn StorageProvisioner>>) -> Self {
        Pool {
            vms: Vec::new(),
            provisioner,
            shared: None,
        }
    }

    pub fn vms(&self) -> &[VirtualMachine] {
        &self.vms
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    /// Builds the ZFS pool or volume group every VM volume is carved from.
    pub fn create_shared(&mut self, storage: &StorageConfig) -> Result<()> {
        let provisioner = self.provisioner.as_ref().ok_or_else(|| {
            Error::InvalidConfig(String::from("storage requested without a provisioner"))
        })?;
        provisioner
            .create_pool(&storage.pool, &storage.device)
            .map_err(Error::CreatePool)?;
        info!(
            "Created {} pool {} on {}",
            provisioner.kind(),
            storage.pool,
            storage.device.display()
        );
        self.shared = Some(SharedStorage {
            pool: storage.pool.clone(),
            device: storage.device.clone(),
        });
        Ok(())
    }

    /// Brings the VMs up one after the other, each with its own volume when
    /// storage is configured.
    ///
    /// Either all `config.pool_size` VMs end up ready, or every VM started
    /// so far is torn down again and the error is returned.
    pub fn allocate(
        &mut self,
        config: &RunConfig,
        manager: &VmManager,
        run_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<()> {
        for index in 0..config.pool_size {
            if let Err(e) = self.allocate_one(config, manager, run_dir, index, cancel) {
                let report = self.release_vms();
                if !report.is_clean() {
                    warn!(
                        "Rolling back the pool left {} errors",
                        report.errors.len()
                    );
                }
                return Err(e);
            }
        }
        info!("All {} VMs are ready", self.vms.len());
        Ok(())
    }

    fn allocate_one(
        &mut self,
        config: &RunConfig,
        manager: &VmManager,
        run_dir: &Path,
        index: usize,
        cancel: &CancelToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Aborted);
        }

        let port = config.port(index);
        let result_dir = run_dir.join(format!("vm-port-{port}"));
        fs::create_dir_all(&result_dir).map_err(|source| Error::ResultDir {
            path: result_dir.clone(),
            source,
        })?;

        let storage = match (&self.provisioner, &config.storage) {
            (Some(provisioner), Some(storage)) => Some(
                provisioner
                    .provision(&VolumeRequest::for_port(&storage.pool, port, storage.size_gib))
                    .map_err(|source| Error::Provision { port, source })?,
            ),
            _ => None,
        };

        let spec = VmSpec {
            index,
            port,
            pool_size: config.pool_size,
            result_dir,
            template: config.vm.clone(),
            wwpn: storage.as_ref().map(|s| s.wwpn.clone()),
        };
        match manager.start(spec, cancel) {
            Ok(mut vm) => {
                if let Some(storage) = storage {
                    vm.attach_storage(storage);
                }
                self.vms.push(vm);
                Ok(())
            }
            Err(source) => {
                if let (Some(provisioner), Some(storage)) = (&self.provisioner, storage) {
                    provisioner.release(&storage);
                }
                Err(Error::StartVm { port, source })
            }
        }
    }

    /// Stops every VM and releases its storage, last VM first.
    fn release_vms(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        while let Some(mut vm) = self.vms.pop() {
            report.extend(vm.shutdown());
            if let Some(storage) = vm.take_storage() {
                match &self.provisioner {
                    Some(provisioner) => report.extend(
                        provisioner
                            .release(&storage)
                            .into_iter()
                            .map(|e| format!("VM localhost:{}: {e}", vm.port())),
                    ),
                    None => report.push(format!(
                        "VM localhost:{}: no provisioner to release {}",
                        vm.port(),
                        storage.wwpn
                    )),
                }
            }
        }
        report
    }

    /// Tears the VMs down, then the shared storage.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = self.release_vms();
        if let Some(shared) = self.shared.take() {
            if let Some(provisioner) = &self.provisioner {
                if let Err(e) = provisioner.destroy_pool(&shared.pool, &shared.device) {
                    report.push(format!("pool {}: {e}", shared.pool));
                } else {
                    info!("Destroyed pool {}", shared.pool);
                }
            }
        }
        report
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.teardown();
    }
}
