// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Block volume managers driving the ZFS and LVM command line tools.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bench_infra::HostExec;
use log::info;

use crate::{BackendKind, Error, Result};

pub trait VolumeManager: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Checks that the tool stack is installed.
    fn check_tools(&self) -> Result<()>;

    fn create_pool(&self, pool: &str, device: &Path) -> Result<()>;

    /// Carves a fixed size volume and returns the block device backing it.
    fn create_volume(&self, pool: &str, volume: &str, size_gib: u64) -> Result<PathBuf>;

    fn destroy_volume(&self, pool: &str, volume: &str) -> Result<()>;

    fn destroy_pool(&self, pool: &str, device: &Path) -> Result<()>;

    fn device_path(&self, pool: &str, volume: &str) -> PathBuf;
}

pub struct Zfs {
    exec: Arc<dyn HostExec>,
}

impl Zfs {
    /// Block size of the zvols created for benchmarks.
    pub const VOLBLOCKSIZE: &'static str = "16K";

    pub fn new(exec: Arc<dyn HostExec>) -> Self {
        Zfs { exec }
    }
}

impl VolumeManager for Zfs {
    fn kind(&self) -> BackendKind {
        BackendKind::Zfs
    }

    fn check_tools(&self) -> Result<()> {
        self.exec
            .exec("zfs", &["version"])
            .map_err(|source| Error::ToolMissing {
                tool: "zfs",
                source,
            })?;
        Ok(())
    }

    fn create_pool(&self, pool: &str, device: &Path) -> Result<()> {
        let device = device.to_string_lossy();
        // No mountpoint: the pool only ever holds zvols
        self.exec
            .exec("zpool", &["create", "-f", "-m", "none", pool, &device])
            .map_err(|source| Error::CreatePool {
                pool: pool.to_string(),
                source,
            })?;
        info!("Created zpool {pool} on {device}");
        Ok(())
    }

    fn create_volume(&self, pool: &str, volume: &str, size_gib: u64) -> Result<PathBuf> {
        let dataset = format!("{pool}/{volume}");
        let size = format!("{size_gib}G");
        self.exec
            .exec(
                "zfs",
                &["create", "-V", &size, "-b", Self::VOLBLOCKSIZE, &dataset],
            )
            .map_err(|source| Error::CreateVolume {
                volume: dataset.clone(),
                source,
            })?;
        Ok(self.device_path(pool, volume))
    }

    fn destroy_volume(&self, pool: &str, volume: &str) -> Result<()> {
        let dataset = format!("{pool}/{volume}");
        self.exec
            .exec("zfs", &["destroy", &dataset])
            .map_err(|source| Error::DestroyVolume {
                volume: dataset.clone(),
                source,
            })?;
        Ok(())
    }

    fn destroy_pool(&self, pool: &str, _device: &Path) -> Result<()> {
        self.exec
            .exec("zpool", &["destroy", pool])
            .map_err(|source| Error::DestroyPool {
                pool: pool.to_string(),
                source,
            })?;
        Ok(())
    }

    fn device_path(&self, pool: &str, volume: &str) -> PathBuf {
        Path::new("/dev/zvol").join(pool).join(volume)
    }
}

pub struct Lvm {
    exec: Arc<dyn HostExec>,
}

impl Lvm {
    pub fn new(exec: Arc<dyn HostExec>) -> Self {
        Lvm { exec }
    }
}

impl VolumeManager for Lvm {
    fn kind(&self) -> BackendKind {
        BackendKind::Lvm
    }

    fn check_tools(&self) -> Result<()> {
        self.exec
            .exec("lvm", &["version"])
            .map_err(|source| Error::ToolMissing {
                tool: "lvm",
                source,
            })?;
        Ok(())
    }

    fn create_pool(&self, group: &str, device: &Path) -> Result<()> {
        let device = device.to_string_lossy();
        let map_err = |source| Error::CreatePool {
            pool: group.to_string(),
            source,
        };
        self.exec.exec("pvcreate", &[&device]).map_err(map_err)?;
        self.exec
            .exec("vgcreate", &[group, &device])
            .map_err(map_err)?;
        info!("Created volume group {group} on {device}");
        Ok(())
    }

    fn create_volume(&self, group: &str, volume: &str, size_gib: u64) -> Result<PathBuf> {
        let size = format!("{size_gib}G");
        self.exec
            .exec("lvcreate", &["-L", &size, "--name", volume, group])
            .map_err(|source| Error::CreateVolume {
                volume: format!("{group}/{volume}"),
                source,
            })?;
        Ok(self.device_path(group, volume))
    }

    fn destroy_volume(&self, group: &str, volume: &str) -> Result<()> {
        let path = self.device_path(group, volume);
        self.exec
            .exec("lvremove", &["-y", &path.to_string_lossy()])
            .map_err(|source| Error::DestroyVolume {
                volume: format!("{group}/{volume}"),
                source,
            })?;
        Ok(())
    }

    fn destroy_pool(&self, group: &str, device: &Path) -> Result<()> {
        let map_err = |source| Error::DestroyPool {
            pool: group.to_string(),
            source,
        };
        self.exec.exec("vgremove", &["-y", group]).map_err(map_err)?;
        self.exec
            .exec("pvremove", &["-y", &device.to_string_lossy()])
            .map_err(map_err)?;
        Ok(())
    }

    fn device_path(&self, group: &str, volume: &str) -> PathBuf {
        Path::new("/dev").join(group).join(volume)
    }
}
