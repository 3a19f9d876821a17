// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bench_infra::PasswordAuth;
use fio_bench::BenchmarkMatrix;
use serde::{Deserialize, Serialize};
use storage_backend::BackendKind;
use vm_manager::{ReadinessPolicy, VmTemplate};

use crate::{Error, Result};

pub const DEFAULT_POOL_NAME: &str = "fiotest";

/// Upper bound for every configured delay and interval, one day.
const MAX_TIMING: Duration = Duration::from_secs(24 * 60 * 60);

/// Volumes carved for the VMs and exported over vhost-scsi.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub kind: BackendKind,
    /// Physical device the pool or volume group is built on.
    pub device: PathBuf,
    #[serde(default = "default_pool_name")]
    pub pool: String,
    #[serde(default = "default_volume_size")]
    pub size_gib: u64,
}

fn default_pool_name() -> String {
    String::from(DEFAULT_POOL_NAME)
}

fn default_volume_size() -> u64 {
    60
}

impl StorageConfig {
    pub fn new(kind: BackendKind, device: PathBuf) -> Self {
        StorageConfig {
            kind,
            device,
            pool: default_pool_name(),
            size_gib: default_volume_size(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    /// Added to the matrix duration to absorb setup and teardown.
    pub fixed_buffer: Duration,
    pub heartbeat_interval: Duration,
    /// Pause before starting the benchmark on each VM.
    pub dispatch_stagger: Duration,
    pub readiness: ReadinessPolicy,
    /// How long fio may outlive the expected end of the matrix.
    pub finish_grace: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            fixed_buffer: Duration::from_secs(3 * 60),
            heartbeat_interval: Duration::from_secs(60),
            dispatch_stagger: Duration::from_secs(5),
            readiness: ReadinessPolicy::default(),
            finish_grace: Duration::from_secs(60),
        }
    }
}

/// Everything a benchmark run depends on. Built once and handed to the
/// orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub pool_size: usize,
    /// SSH port forwarded to the first VM, the others follow.
    pub base_port: u16,
    pub vm: VmTemplate,
    pub credentials: PasswordAuth,
    pub storage: Option<StorageConfig>,
    pub matrix: BenchmarkMatrix,
    /// fio target inside the guest.
    pub fio_target: Option<String>,
    /// fio verify algorithm, e.g. `crc32c`.
    pub verify: Option<String>,
    pub results_root: PathBuf,
    pub timing: Timing,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            pool_size: 1,
            base_port: 6666,
            vm: VmTemplate::default(),
            credentials: PasswordAuth {
                username: String::from("ubuntu"),
                password: String::from("asdfqwer"),
            },
            storage: None,
            matrix: BenchmarkMatrix::default(),
            fio_target: None,
            verify: None,
            results_root: PathBuf::from("."),
            timing: Timing::default(),
        }
    }
}

impl RunConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::InvalidConfig(String::from(
                "the pool needs at least one VM",
            )));
        }
        let last_port = u16::try_from(self.pool_size - 1)
            .ok()
            .and_then(|n| self.base_port.checked_add(n));
        if last_port.is_none() {
            return Err(Error::InvalidConfig(format!(
                "{} VMs do not fit in the port range starting at {}",
                self.pool_size, self.base_port
            )));
        }
        if self.vm.vcpus == 0 || self.vm.memory_mib == 0 {
            return Err(Error::InvalidConfig(String::from(
                "VMs need at least one vCPU and some memory",
            )));
        }
        if !self.vm.image.exists() {
            return Err(Error::InvalidConfig(format!(
                "VM image {} does not exist",
                self.vm.image.display()
            )));
        }
        if let Some(storage) = &self.storage {
            if storage.device.as_os_str().is_empty() {
                return Err(Error::InvalidConfig(String::from(
                    "a storage backend needs a device",
                )));
            }
            // fio works on all of the volume but 1 GiB
            if storage.size_gib < 2 {
                return Err(Error::InvalidConfig(String::from(
                    "volumes need at least 2 GiB",
                )));
            }
        }
        let t = &self.timing;
        for (name, value) in [
            ("fixed_buffer", t.fixed_buffer),
            ("heartbeat_interval", t.heartbeat_interval),
            ("dispatch_stagger", t.dispatch_stagger),
            ("finish_grace", t.finish_grace),
            ("readiness delay", t.readiness.delay),
            ("readiness dial_timeout", t.readiness.dial_timeout),
        ] {
            if value > MAX_TIMING {
                return Err(Error::InvalidConfig(format!(
                    "{name} of {}s exceeds one day",
                    value.as_secs()
                )));
            }
        }
        self.matrix.validate().map_err(Error::Matrix)
    }

    /// The matrix fio runs. With storage attached, fio works on the whole
    /// exported volume but 1 GiB, whatever size the matrix asks for.
    pub fn fio_matrix(&self) -> BenchmarkMatrix {
        let mut matrix = self.matrix.clone();
        if let Some(storage) = &self.storage {
            matrix.size = format!("{}G", storage.size_gib.saturating_sub(1));
        }
        matrix
    }

    /// Forwarded SSH port of VM `index`, also its name in the run.
    pub fn port(&self, index: usize) -> u16 {
        self.base_port + index as u16
    }
}
