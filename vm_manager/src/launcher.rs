// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs::{self, File};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use bench_infra::{kill_child, CancelToken, DEFAULT_KILL_GRACE};
use log::{debug, info, warn};
use wait_timeout::ChildExt;

use crate::{Error, Result};

pub const QEMU_CMD_FILE: &str = "qemu-cmd.ini";
pub const QEMU_LOG_FILE: &str = "qemu.log";

/// What a hypervisor needs to boot one VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSpec {
    pub port: u16,
    pub config: PathBuf,
    pub seed_image: PathBuf,
    pub result_dir: PathBuf,
}

pub trait Hypervisor: Send + Sync {
    /// Runs the VM until the hypervisor exits or `cancel` fires, in which
    /// case the hypervisor is stopped. Blocks for the whole VM lifetime.
    fn run(&self, spec: &LaunchSpec, cancel: &CancelToken) -> Result<()>;
}

pub struct Qemu {
    binary: PathBuf,
    poll_interval: Duration,
    kill_grace: Duration,
}

impl Qemu {
    pub fn new<P: AsRef<Path>>(binary: P) -> Self {
        Qemu {
            binary: binary.as_ref().to_path_buf(),
            poll_interval: Duration::from_millis(200),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn command(&self, spec: &LaunchSpec) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-cpu", "host", "-readconfig"])
            .arg(&spec.config)
            .args(["-display", "none", "-cdrom"])
            .arg(&spec.seed_image)
            .args(["-device", "e1000,netdev=net0", "-netdev"])
            .arg(format!("user,id=net0,hostfwd=tcp::{}-:22", spec.port))
            .args(["-serial", "chardev:ch0"])
            .current_dir(&spec.result_dir);
        cmd
    }
}

fn command_string(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|s| s.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

impl Hypervisor for Qemu {
    fn run(&self, spec: &LaunchSpec, cancel: &CancelToken) -> Result<()> {
        let mut cmd = self.command(spec);

        let cmd_file = spec.result_dir.join(QEMU_CMD_FILE);
        fs::write(&cmd_file, command_string(&cmd)).map_err(|source| Error::ConfigWrite {
            path: cmd_file,
            source,
        })?;

        let log_path = spec.result_dir.join(QEMU_LOG_FILE);
        let log = File::create(&log_path).map_err(|source| Error::ConfigWrite {
            path: log_path.clone(),
            source,
        })?;
        let log_err = log.try_clone().map_err(|source| Error::ConfigWrite {
            path: log_path,
            source,
        })?;

        // Own process group so that stopping the VM reaches every helper
        // the hypervisor forked.
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0)
            .spawn()
            .map_err(|source| Error::Spawn {
                port: spec.port,
                source,
            })?;
        info!(
            "Started hypervisor for VM localhost:{} (pid {})",
            spec.port,
            child.id()
        );

        loop {
            if cancel.is_cancelled() {
                debug!("Stopping hypervisor of VM localhost:{}", spec.port);
                kill_child(&mut child, self.kill_grace).map_err(|source| Error::Spawn {
                    port: spec.port,
                    source,
                })?;
                return Ok(());
            }

            match child.wait_timeout(self.poll_interval) {
                Ok(Some(status)) if status.success() => {
                    info!("Hypervisor of VM localhost:{} exited", spec.port);
                    return Ok(());
                }
                Ok(Some(status)) => {
                    warn!(
                        "Hypervisor of VM localhost:{} failed ({status}), see {}",
                        spec.port,
                        spec.result_dir.join(QEMU_LOG_FILE).display()
                    );
                    return Err(Error::HypervisorExit {
                        port: spec.port,
                        status,
                    });
                }
                Ok(None) => (),
                Err(source) => {
                    let _ = kill_child(&mut child, self.kill_grace);
                    return Err(Error::Spawn {
                        port: spec.port,
                        source,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;
    use std::thread;
    use std::time::Instant;

    use vmm_sys_util::tempdir::TempDir;

    use super::*;

    fn spec(tmp_dir: &TempDir) -> LaunchSpec {
        LaunchSpec {
            port: 6666,
            config: tmp_dir.as_path().join("qemu.cfg"),
            seed_image: PathBuf::from("/images/user-data.img"),
            result_dir: tmp_dir.as_path().to_path_buf(),
        }
    }

    // Stands in for QEMU: logs its arguments and then behaves as `body`.
    fn fake_qemu(tmp_dir: &TempDir, body: &str) -> PathBuf {
        let path = tmp_dir.as_path().join("fake-qemu");
        fs::write(&path, format!("#!/bin/sh\necho \"$@\"\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_command_line() {
        let tmp_dir = TempDir::new_with_prefix("/tmp/autobench-qemu").unwrap();
        let cmd = Qemu::new("qemu-system-x86_64").command(&spec(&tmp_dir));
        assert_eq!(
            command_string(&cmd),
            format!(
                "qemu-system-x86_64 -cpu host -readconfig {}/qemu.cfg -display none \
                 -cdrom /images/user-data.img -device e1000,netdev=net0 \
                 -netdev user,id=net0,hostfwd=tcp::6666-:22 -serial chardev:ch0",
                tmp_dir.as_path().display()
            )
        );
    }

    #[test]
    fn test_run_until_cancelled() {
        let tmp_dir = TempDir::new_with_prefix("/tmp/autobench-qemu").unwrap();
        let qemu = Qemu::new(fake_qemu(&tmp_dir, "exec sleep 60"))
            .with_kill_grace(Duration::from_secs(5));
        let spec = spec(&tmp_dir);
        let cancel = CancelToken::new();

        let start = Instant::now();
        let t = {
            let cancel = cancel.clone();
            thread::spawn(move || qemu.run(&spec, &cancel))
        };
        thread::sleep(Duration::from_millis(300));
        cancel.cancel();
        t.join().unwrap().unwrap();
        assert!(start.elapsed() < Duration::from_secs(30));

        let log = fs::read_to_string(tmp_dir.as_path().join(QEMU_LOG_FILE)).unwrap();
        assert!(log.contains("hostfwd=tcp::6666-:22"));
        let cmd = fs::read_to_string(tmp_dir.as_path().join(QEMU_CMD_FILE)).unwrap();
        assert!(cmd.contains("-readconfig"));
    }

    #[test]
    fn test_hypervisor_failure() {
        let tmp_dir = TempDir::new_with_prefix("/tmp/autobench-qemu").unwrap();
        let qemu = Qemu::new(fake_qemu(&tmp_dir, "exit 1"));

        match qemu.run(&spec(&tmp_dir), &CancelToken::new()) {
            Err(Error::HypervisorExit { port, status }) => {
                assert_eq!(port, 6666);
                assert_eq!(status.code(), Some(1));
            }
            r => panic!("unexpected result {r:?}"),
        }
    }

    #[test]
    fn test_missing_binary() {
        let tmp_dir = TempDir::new_with_prefix("/tmp/autobench-qemu").unwrap();
        let qemu = Qemu::new("/nonexistent/qemu-system-x86_64");
        assert!(matches!(
            qemu.run(&spec(&tmp_dir), &CancelToken::new()),
            Err(Error::Spawn { port: 6666, .. })
        ));
    }
}
