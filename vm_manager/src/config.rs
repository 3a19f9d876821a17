// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! QEMU `-readconfig` file rendering.

use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Hypervisor settings shared by every VM of a run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmTemplate {
    pub qemu_binary: PathBuf,
    pub image: PathBuf,
    pub seed_image: PathBuf,
    pub format: String,
    pub vcpus: u32,
    pub memory_mib: u64,
}

impl Default for VmTemplate {
    fn default() -> Self {
        VmTemplate {
            qemu_binary: PathBuf::from("qemu-system-x86_64"),
            image: PathBuf::from("bionic-server-cloudimg-i386.img"),
            seed_image: PathBuf::from("user-data.img"),
            format: String::from("raw"),
            vcpus: 2,
            memory_mib: 512,
        }
    }
}

/// Everything the configuration of one VM depends on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmParams {
    pub image: PathBuf,
    pub format: String,
    pub vcpus: u32,
    pub memory_mib: u64,
    /// vhost-scsi target the guest gets as an extra SCSI HBA.
    pub wwpn: Option<String>,
    /// Directory receiving the console log and the control sockets.
    pub run_dir: PathBuf,
}

pub const SERIAL_SOCKET: &str = "qemu.serial.socket";
pub const MONITOR_SOCKET: &str = "qemu.monitor.socket";
pub const GUEST_LOG: &str = "guest.log";

pub fn render_config(params: &VmParams) -> String {
    let mut cfg = String::new();
    let run_dir = params.run_dir.display();

    // Writing to a String cannot fail
    let _ = write!(
        cfg,
        r#"
[drive "hd"]
  if = "none"
  file = "{}"
  format = "{}"

[device]
  driver = "intel-iommu"
  caching-mode = "on"

[device "scsi"]
  driver = "virtio-scsi-pci"
  bus = "pcie.0"
  addr = "0x7"

[device]
  driver = "scsi-hd"
  drive = "hd"
"#,
        params.image.display(),
        params.format
    );

    if let Some(wwpn) = &params.wwpn {
        let _ = write!(
            cfg,
            r#"
[device]
  driver = "vhost-scsi-pci"
  wwpn = "{wwpn}"
  bus = "pcie.0"
  addr = "0x08"
"#
        );
    }

    let _ = write!(
        cfg,
        r#"
[rtc]
  base = "localtime"
  driftfix = "slew"

[global]
  driver = "kvm-pit"
  property = "lost_tick_policy"
  value = "delay"

[global]
  driver = "ICH9-LPC"
  property = "disable_s3"
  value = "1"

[global]
  driver = "ICH9-LPC"
  property = "disable_s4"
  value = "1"

[machine]
  type = "pc-q35-3.1"
  dump-guest-core = "off"
  accel = "kvm"
  vmport = "off"
  kernel-irqchip = "on"
  graphics = "off"

[memory]
  size = "{memory}"

[smp-opts]
  cpus = "{vcpus}"
  sockets = "1"
  cores = "{vcpus}"
  threads = "1"

[realtime]
  mlock = "off"

[msg]
  timestamp = "on"

[chardev "ch0"]
  backend = "socket"
  path = "{run_dir}/{SERIAL_SOCKET}"
  server = "on"
  wait = "off"
  logfile = "{run_dir}/{GUEST_LOG}"

[chardev "charmonitor"]
  backend = "socket"
  path = "{run_dir}/{MONITOR_SOCKET}"
  server = "on"
  wait = "off"

[mon "charmonitor"]
  mode = "readline"
  chardev = "charmonitor"
"#,
        memory = params.memory_mib,
        vcpus = params.vcpus,
    );

    cfg
}

/// Renders the configuration of a VM into `path`.
pub fn write_config(path: &Path, params: &VmParams) -> Result<()> {
    fs::write(path, render_config(params)).map_err(|source| Error::ConfigWrite {
        path: path.to_path_buf(),
        source,
    })
}
