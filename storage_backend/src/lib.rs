// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Per-VM block storage: a volume carved out of a ZFS pool or an LVM
//! volume group, exported to the hypervisor as a vhost-scsi target.

pub mod lio;
pub mod naa;
pub mod volume;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use bench_infra::{HostCommandError, HostExec};
use log::{info, warn};
use rand::thread_rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use lio::{Backoff, LioTarget};
pub use naa::SerialAllocator;
pub use volume::{Lvm, VolumeManager, Zfs};

#[derive(Error, Debug)]
pub enum Error {
    #[error("{tool} tools are not available")]
    ToolMissing {
        tool: &'static str,
        #[source]
        source: HostCommandError,
    },
    #[error("target configfs is not available at {path}")]
    ConfigfsMissing {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create pool {pool}")]
    CreatePool {
        pool: String,
        #[source]
        source: HostCommandError,
    },
    #[error("failed to create volume {volume}")]
    CreateVolume {
        volume: String,
        #[source]
        source: HostCommandError,
    },
    #[error("failed to destroy volume {volume}")]
    DestroyVolume {
        volume: String,
        #[source]
        source: HostCommandError,
    },
    #[error("failed to destroy pool {pool}")]
    DestroyPool {
        pool: String,
        #[source]
        source: HostCommandError,
    },
    #[error("configfs access to {path} failed")]
    Configfs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0} did not appear in time")]
    WaitForFile(PathBuf),
    #[error("empty unit serial in {0}")]
    EmptySerial(PathBuf),
    #[error("target {0} does not exist")]
    TargetMissing(String),
    #[error("vhost endpoint {0} does not exist")]
    VhostMissing(String),
    #[error("failed to export target {target_id} as {wwpn}")]
    Export {
        target_id: String,
        wwpn: String,
        #[source]
        source: Box<Error>,
    },
    #[error("unknown storage backend {0:?}, expected \"zfs\" or \"lvm\"")]
    UnknownKind(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Zfs,
    Lvm,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Zfs => write!(f, "zfs"),
            BackendKind::Lvm => write!(f, "lvm"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "zfs" => Ok(BackendKind::Zfs),
            "lvm" => Ok(BackendKind::Lvm),
            _ => Err(Error::UnknownKind(s.to_string())),
        }
    }
}

/// What to carve for one VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeRequest {
    pub pool: String,
    pub volume: String,
    pub size_gib: u64,
    pub target_id: String,
}

impl VolumeRequest {
    /// Names derived from the forwarded SSH port of the VM, which is
    /// unique within a run.
    pub fn for_port(pool: &str, port: u16, size_gib: u64) -> Self {
        VolumeRequest {
            pool: pool.to_string(),
            volume: format!("vm{port}"),
            size_gib,
            target_id: format!("{pool}{port}_iblock"),
        }
    }
}

/// A provisioned and exported volume.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StorageBackend {
    pub kind: BackendKind,
    pub pool: String,
    pub volume: String,
    pub size_gib: u64,
    pub device_path: PathBuf,
    pub target_id: String,
    pub serial: String,
    pub wwpn: String,
}

/// Host storage operations needed by a benchmark run.
///
/// Every teardown operation is independent and safe to attempt on a
/// partially created resource.
pub trait StorageProvisioner: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Verifies the host has the volume tools and a mounted target stack.
    fn check_environment(&self) -> Result<()>;

    fn create_pool(&self, pool: &str, device: &Path) -> Result<()>;

    fn create_volume(&self, pool: &str, volume: &str, size_gib: u64) -> Result<PathBuf>;

    /// Exports `device` as IBlock target `target_id` through vhost-scsi and
    /// returns the WWPN the hypervisor attaches to. On failure nothing of
    /// the export is left behind.
    fn export_volume(&self, device: &Path, target_id: &str) -> Result<String>;

    fn unexport_volume(&self, wwpn: &str) -> Result<()>;

    fn delete_target(&self, target_id: &str) -> Result<()>;

    fn destroy_volume(&self, pool: &str, volume: &str) -> Result<()>;

    fn destroy_pool(&self, pool: &str, device: &Path) -> Result<()>;

    /// Creates and exports one volume. If the export fails the volume is
    /// destroyed again before the error is returned.
    fn provision(&self, request: &VolumeRequest) -> Result<StorageBackend> {
        let device_path =
            self.create_volume(&request.pool, &request.volume, request.size_gib)?;

        let wwpn = match self.export_volume(&device_path, &request.target_id) {
            Ok(wwpn) => wwpn,
            Err(e) => {
                if let Err(e) = self.destroy_volume(&request.pool, &request.volume) {
                    warn!("Rollback of volume {} failed: {e}", request.volume);
                }
                return Err(e);
            }
        };

        Ok(StorageBackend {
            kind: self.kind(),
            pool: request.pool.clone(),
            volume: request.volume.clone(),
            size_gib: request.size_gib,
            device_path,
            target_id: request.target_id.clone(),
            serial: wwpn.trim_start_matches("naa.").to_string(),
            wwpn,
        })
    }

    /// Best-effort teardown in dependency order: export, target, volume.
    /// Every step runs; failures are logged and returned.
    fn release(&self, backend: &StorageBackend) -> Vec<Error> {
        let steps = [
            self.unexport_volume(&backend.wwpn),
            self.delete_target(&backend.target_id),
            self.destroy_volume(&backend.pool, &backend.volume),
        ];

        let errors: Vec<Error> = steps.into_iter().filter_map(|r| r.err()).collect();
        for e in &errors {
            warn!("Releasing storage of {}: {e}", backend.volume);
        }
        errors
    }
}

/// Provisioner acting on the local host.
pub struct HostProvisioner {
    volumes: Box<dyn VolumeManager>,
    lio: LioTarget,
    serials: Mutex<SerialAllocator>,
}

impl HostProvisioner {
    pub fn new(kind: BackendKind, exec: Arc<dyn HostExec>) -> Self {
        let volumes: Box<dyn VolumeManager> = match kind {
            BackendKind::Zfs => Box::new(Zfs::new(exec)),
            BackendKind::Lvm => Box::new(Lvm::new(exec)),
        };
        HostProvisioner {
            volumes,
            lio: LioTarget::default(),
            serials: Mutex::new(SerialAllocator::new()),
        }
    }

    pub fn with_lio(mut self, lio: LioTarget) -> Self {
        self.lio = lio;
        self
    }
}

impl StorageProvisioner for HostProvisioner {
    fn kind(&self) -> BackendKind {
        self.volumes.kind()
    }

    fn check_environment(&self) -> Result<()> {
        self.volumes.check_tools()?;
        self.lio.check()
    }

    fn create_pool(&self, pool: &str, device: &Path) -> Result<()> {
        self.volumes.create_pool(pool, device)
    }

    fn create_volume(&self, pool: &str, volume: &str, size_gib: u64) -> Result<PathBuf> {
        let device = self.volumes.create_volume(pool, volume, size_gib)?;
        info!(
            "Created {} volume {pool}/{volume} ({size_gib} GiB)",
            self.kind()
        );
        Ok(device)
    }

    fn export_volume(&self, device: &Path, target_id: &str) -> Result<String> {
        let serial = self.serials.lock().unwrap().allocate(&mut thread_rng());
        self.lio.export(device, target_id, &serial).inspect_err(|_| {
            self.serials.lock().unwrap().release(&serial);
        })
    }

    fn unexport_volume(&self, wwpn: &str) -> Result<()> {
        self.lio.unexport(wwpn)?;
        self.serials
            .lock()
            .unwrap()
            .release(wwpn.trim_start_matches("naa."));
        Ok(())
    }

    fn delete_target(&self, target_id: &str) -> Result<()> {
        self.lio.delete_target(target_id)
    }

    fn destroy_volume(&self, pool: &str, volume: &str) -> Result<()> {
        self.volumes.destroy_volume(pool, volume)
    }

    fn destroy_pool(&self, pool: &str, device: &Path) -> Result<()> {
        self.volumes.destroy_pool(pool, device)
    }
}
