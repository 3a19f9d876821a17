// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! LIO IBlock backstores and vhost-scsi fabric endpoints, driven through
//! the target configfs tree.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::naa::wwpn_from_serial;
use crate::{Error, Result};

pub const CONFIGFS_TARGET_ROOT: &str = "/sys/kernel/config/target";

const IBLOCK_HBA: &str = "core/iblock_0";
const VHOST_TPG: &str = "tpgt_1";
const VHOST_LUN: &str = "lun/lun_0";
const VHOST_CONTROL: &str = "scsi_host_id=1,scsi_channel_id=0,scsi_target_id=0,scsi_lun_id=0";

/// Polling schedule used while the kernel materializes configfs attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    /// Cap on a single delay.
    pub max_delay: Duration,
    /// Total time spent sleeping before giving up.
    pub budget: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            initial: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            budget: Duration::from_secs(5),
        }
    }
}

impl Backoff {
    /// Waits for `path` to appear. Probes right away, then after delays
    /// doubling from `initial` up to `max_delay`. The last delay is cut
    /// short so that no more than `budget` is spent sleeping.
    pub fn wait_for_file(&self, path: &Path) -> Result<()> {
        let mut delay = self.initial.max(Duration::from_millis(1));
        let mut waited = Duration::ZERO;
        loop {
            if path.exists() {
                return Ok(());
            }
            let remaining = self.budget.saturating_sub(waited);
            if remaining.is_zero() {
                return Err(Error::WaitForFile(path.to_path_buf()));
            }
            let sleep = delay.min(remaining);
            thread::sleep(sleep);
            waited += sleep;
            delay = delay.saturating_mul(2).min(self.max_delay);
        }
    }
}

#[derive(Clone, Debug)]
pub struct LioTarget {
    root: PathBuf,
    backoff: Backoff,
}

impl Default for LioTarget {
    fn default() -> Self {
        Self::new(CONFIGFS_TARGET_ROOT)
    }
}

impl LioTarget {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        LioTarget {
            root: root.as_ref().to_path_buf(),
            backoff: Backoff::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn target_root(&self, target_id: &str) -> PathBuf {
        self.root.join(IBLOCK_HBA).join(target_id)
    }

    fn vhost_tpg(&self, wwpn: &str) -> PathBuf {
        self.root.join("vhost").join(wwpn).join(VHOST_TPG)
    }

    /// Checks that the target core and the vhost fabric are mounted.
    pub fn check(&self) -> Result<()> {
        for path in [
            self.root.clone(),
            self.root.join("core"),
            self.root.join("vhost"),
        ] {
            fs::metadata(&path).map_err(|source| Error::ConfigfsMissing { path, source })?;
        }
        Ok(())
    }

    /// Creates the IBlock backstore for `device` and stamps `serial` into
    /// its unit serial attribute.
    pub fn create_iblock(&self, device: &Path, target_id: &str, serial: &str) -> Result<()> {
        let target_root = self.target_root(target_id);
        fs::create_dir_all(&target_root).map_err(configfs_err(&target_root))?;

        let control = target_root.join("control");
        self.backoff.wait_for_file(&control)?;
        write_attr(&control, &format!("udev_path={}", device.display()))?;
        write_attr(&target_root.join("wwn/vpd_unit_serial"), serial)?;
        write_attr(&target_root.join("enable"), "1")?;

        debug!(
            "Created IBlock {target_id} for {} with serial {serial}",
            device.display()
        );
        Ok(())
    }

    /// Reads the serial back from the backstore. The kernel reports it as
    /// "T10 VPD Unit Serial Number: <serial>".
    pub fn target_serial(&self, target_id: &str) -> Result<String> {
        let path = self.target_root(target_id).join("wwn/vpd_unit_serial");
        let content = fs::read_to_string(&path).map_err(configfs_err(&path))?;
        content
            .split_whitespace()
            .last()
            .map(str::to_string)
            .ok_or(Error::EmptySerial(path))
    }

    pub fn vhost_exists(&self, target_id: &str) -> Result<bool> {
        let serial = self.target_serial(target_id)?;
        let link = self
            .vhost_tpg(&wwpn_from_serial(&serial))
            .join(VHOST_LUN)
            .join("iblock");
        Ok(link.symlink_metadata().is_ok())
    }

    /// Creates the vhost-scsi endpoint `wwpn` and maps the backstore of
    /// `target_id` as its first LUN. An existing link is left alone.
    pub fn create_vhost(&self, target_id: &str, wwpn: &str) -> Result<()> {
        let target_root = self.target_root(target_id);
        fs::metadata(&target_root).map_err(|_| Error::TargetMissing(target_id.to_string()))?;

        let tpg = self.vhost_tpg(wwpn);
        let lun = tpg.join(VHOST_LUN);
        fs::create_dir_all(&lun).map_err(configfs_err(&lun))?;

        write_attr(&target_root.join("control"), VHOST_CONTROL)?;

        let nexus = tpg.join("nexus");
        self.backoff.wait_for_file(&nexus)?;
        write_attr(&nexus, wwpn)?;

        let link = lun.join("iblock");
        if link.symlink_metadata().is_err() {
            symlink(&target_root, &link).map_err(configfs_err(&link))?;
        }

        Ok(())
    }

    /// Exposes `device` as a vhost-scsi target and returns its WWPN.
    ///
    /// On failure the half created endpoint and the IBlock backstore are
    /// removed before the error is returned, which releases `device`.
    pub fn export(&self, device: &Path, target_id: &str, serial: &str) -> Result<String> {
        let wwpn = wwpn_from_serial(serial);
        if let Err(e) = self.create_iblock(device, target_id, serial) {
            self.discard_target(target_id);
            return Err(e);
        }

        if !self.vhost_exists(target_id).unwrap_or(false) {
            if let Err(e) = self.create_vhost(target_id, &wwpn) {
                if let Err(cleanup) = self.unexport(&wwpn) {
                    warn!("Failed to remove partial vhost endpoint {wwpn}: {cleanup}");
                }
                self.discard_target(target_id);
                return Err(Error::Export {
                    target_id: target_id.to_string(),
                    wwpn,
                    source: Box::new(e),
                });
            }
        }

        info!(
            "Exported {} as {wwpn} (target {target_id})",
            device.display()
        );
        Ok(wwpn)
    }

    fn discard_target(&self, target_id: &str) {
        match self.delete_target(target_id) {
            Ok(()) | Err(Error::TargetMissing(_)) => (),
            Err(e) => warn!("Failed to remove partial IBlock target {target_id}: {e}"),
        }
    }

    pub fn unexport(&self, wwpn: &str) -> Result<()> {
        let tpg = self.vhost_tpg(wwpn);
        let lun = tpg.join(VHOST_LUN);
        if !lun.exists() {
            return Err(Error::VhostMissing(wwpn.to_string()));
        }

        let link = lun.join("iblock");
        match fs::remove_file(&link) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                return Err(Error::Configfs { path: link, source: e })
            }
            _ => (),
        }
        remove_config_dir(&lun)?;
        remove_config_dir(&tpg)?;
        if let Some(endpoint) = tpg.parent() {
            remove_config_dir(endpoint)?;
        }
        Ok(())
    }

    pub fn delete_target(&self, target_id: &str) -> Result<()> {
        let target_root = self.target_root(target_id);
        if !target_root.exists() {
            return Err(Error::TargetMissing(target_id.to_string()));
        }
        remove_config_dir(&target_root)
    }
}

fn configfs_err(path: &Path) -> impl FnOnce(io::Error) -> Error + '_ {
    move |source| Error::Configfs {
        path: path.to_path_buf(),
        source,
    }
}

fn write_attr(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value).map_err(configfs_err(path))
}

// configfs groups are removed with a plain rmdir; their attribute files
// cannot be unlinked. Anything else (a regular directory) is removed
// recursively.
fn remove_config_dir(path: &Path) -> Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(_) => fs::remove_dir_all(path).map_err(configfs_err(path)),
    }
}
