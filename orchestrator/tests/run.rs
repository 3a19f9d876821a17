// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bench_infra::{
    CancelToken, Connector, HostCommandError, HostExec, RemoteSession, SshCommandError,
    SshEndpoint,
};
use fio_bench::Workload;
use orchestrator::{
    Collaborators, Error, Orchestrator, Pool, RunConfig, StorageConfig, Timing, REPORT_FILE,
};
use storage_backend::{BackendKind, StorageProvisioner};
use vm_manager::{Hypervisor, LaunchSpec, ReadinessPolicy, VmManager};
use vmm_sys_util::tempdir::TempDir;

type Events = Arc<Mutex<Vec<String>>>;

/// Records every storage operation; fails the creation of one volume.
struct RecordingProvisioner {
    events: Events,
    fail_volume: Option<String>,
    broken_environment: bool,
    exports: AtomicUsize,
}

impl RecordingProvisioner {
    fn record(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl StorageProvisioner for RecordingProvisioner {
    fn kind(&self) -> BackendKind {
        BackendKind::Zfs
    }

    fn check_environment(&self) -> storage_backend::Result<()> {
        if self.broken_environment {
            return Err(storage_backend::Error::ConfigfsMissing {
                path: PathBuf::from("/sys/kernel/config/target"),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        Ok(())
    }

    fn create_pool(&self, pool: &str, _: &Path) -> storage_backend::Result<()> {
        self.record(format!("create_pool {pool}"));
        Ok(())
    }

    fn create_volume(
        &self,
        pool: &str,
        volume: &str,
        _: u64,
    ) -> storage_backend::Result<PathBuf> {
        if self.fail_volume.as_deref() == Some(volume) {
            return Err(storage_backend::Error::CreateVolume {
                volume: volume.to_string(),
                source: HostCommandError::Spawn {
                    command: format!("zfs create {pool}/{volume}"),
                    source: std::io::Error::other("insufficient capacity"),
                },
            });
        }
        self.record(format!("create_volume {volume}"));
        Ok(PathBuf::from(format!("/dev/zvol/{pool}/{volume}")))
    }

    fn export_volume(&self, _: &Path, target_id: &str) -> storage_backend::Result<String> {
        let n = self.exports.fetch_add(1, Ordering::SeqCst);
        let wwpn = format!("naa.5001405{n:09x}");
        self.record(format!("export {target_id} {wwpn}"));
        Ok(wwpn)
    }

    fn unexport_volume(&self, wwpn: &str) -> storage_backend::Result<()> {
        self.record(format!("unexport {wwpn}"));
        Ok(())
    }

    fn delete_target(&self, target_id: &str) -> storage_backend::Result<()> {
        self.record(format!("delete_target {target_id}"));
        Ok(())
    }

    fn destroy_volume(&self, _: &str, volume: &str) -> storage_backend::Result<()> {
        self.record(format!("destroy_volume {volume}"));
        Ok(())
    }

    fn destroy_pool(&self, pool: &str, _: &Path) -> storage_backend::Result<()> {
        self.record(format!("destroy_pool {pool}"));
        Ok(())
    }
}

/// Runs until the VM is cancelled.
#[derive(Default)]
struct FakeHypervisor {
    started: Mutex<Vec<u16>>,
    stopped: AtomicUsize,
}

impl Hypervisor for FakeHypervisor {
    fn run(&self, spec: &LaunchSpec, cancel: &CancelToken) -> vm_manager::Result<()> {
        assert!(spec.config.exists());
        self.started.lock().unwrap().push(spec.port);
        while cancel.sleep(Duration::from_secs(60)) {}
        self.stopped.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeSession {
    closed: AtomicUsize,
}

impl RemoteSession for FakeSession {
    fn run_command(&self, _: &str, _: bool) -> Result<String, SshCommandError> {
        Ok(String::new())
    }
    fn push_file(&self, _: &Path, _: &Path) -> Result<(), SshCommandError> {
        Ok(())
    }
    fn pull_file(&self, _: &Path, _: &Path) -> Result<(), SshCommandError> {
        Ok(())
    }
    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Refuses connections to `unreachable`.
struct FakeConnector {
    unreachable: Option<u16>,
    session: Arc<FakeSession>,
}

impl Connector for FakeConnector {
    fn connect(
        &self,
        endpoint: &SshEndpoint,
        _: Duration,
    ) -> Result<Arc<dyn RemoteSession>, SshCommandError> {
        if self.unreachable == Some(endpoint.port) {
            return Err(SshCommandError::Connection(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )));
        }
        Ok(self.session.clone())
    }
}

#[derive(Clone, Copy)]
enum Behavior {
    Succeed,
    /// The VM on this port fails after the delay, the others run until
    /// cancelled.
    FailOn(u16, Duration),
    RunUntilCancelled,
}

struct FakeWorkload {
    behavior: Behavior,
    runs: AtomicUsize,
    cancelled: AtomicUsize,
}

impl FakeWorkload {
    fn new(behavior: Behavior) -> Self {
        FakeWorkload {
            behavior,
            runs: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }

    fn wait_for_cancel(&self, cancel: &CancelToken) -> fio_bench::Result<()> {
        while cancel.sleep(Duration::from_secs(60)) {}
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        Err(fio_bench::Error::Cancelled)
    }
}

impl Workload for FakeWorkload {
    fn run(
        &self,
        _: &dyn RemoteSession,
        result_dir: &Path,
        cancel: &CancelToken,
    ) -> fio_bench::Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let port: u16 = result_dir
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("vm-port-"))
            .and_then(|p| p.parse().ok())
            .unwrap();

        match self.behavior {
            Behavior::Succeed => {
                fs::write(result_dir.join("result.json"), r#"{"jobs": []}"#).unwrap();
                Ok(())
            }
            Behavior::FailOn(failing, delay) if failing == port => {
                thread::sleep(delay);
                Err(fio_bench::Error::FioNotRunning(delay))
            }
            Behavior::FailOn(..) | Behavior::RunUntilCancelled => self.wait_for_cancel(cancel),
        }
    }
}

struct HostOk;

impl HostExec for HostOk {
    fn exec(&self, _: &str, _: &[&str]) -> Result<String, HostCommandError> {
        Ok(String::from("QEMU emulator version 8.2.2"))
    }
}

struct HostWithoutQemu;

impl HostExec for HostWithoutQemu {
    fn exec(&self, program: &str, _: &[&str]) -> Result<String, HostCommandError> {
        Err(HostCommandError::Spawn {
            command: program.to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
    }
}

struct Harness {
    tmp: TempDir,
    events: Events,
    hypervisor: Arc<FakeHypervisor>,
    session: Arc<FakeSession>,
    workload: Arc<FakeWorkload>,
}

impl Harness {
    fn new(behavior: Behavior) -> Self {
        let tmp = TempDir::new_with_prefix("/tmp/autobench-run").unwrap();
        fs::write(tmp.as_path().join("focal.img"), b"boot").unwrap();
        fs::write(tmp.as_path().join("user-data.img"), b"seed").unwrap();
        Harness {
            tmp,
            events: Arc::new(Mutex::new(Vec::new())),
            hypervisor: Arc::new(FakeHypervisor::default()),
            session: Arc::new(FakeSession::default()),
            workload: Arc::new(FakeWorkload::new(behavior)),
        }
    }

    /// 2 types x 2 block sizes x 2 depths x 1 job: 8 tests.
    fn config(&self, pool_size: usize, storage: bool) -> RunConfig {
        let mut config = RunConfig {
            pool_size,
            results_root: self.tmp.as_path().to_path_buf(),
            timing: Timing {
                fixed_buffer: Duration::from_secs(5),
                heartbeat_interval: Duration::from_millis(50),
                dispatch_stagger: Duration::from_millis(10),
                readiness: ReadinessPolicy {
                    attempts: 3,
                    delay: Duration::from_millis(10),
                    dial_timeout: Duration::from_millis(10),
                },
                finish_grace: Duration::from_secs(1),
            },
            ..Default::default()
        };
        config.vm.image = self.tmp.as_path().join("focal.img");
        config.vm.seed_image = self.tmp.as_path().join("user-data.img");
        config.matrix.set_ops("read,write").unwrap();
        config.matrix.set_block_sizes("4k,64k").unwrap();
        config.matrix.set_depths("8,16").unwrap();
        config.matrix.set_jobs("1").unwrap();
        config.matrix.runtime_secs = 1;
        if storage {
            config.storage = Some(StorageConfig::new(
                BackendKind::Zfs,
                PathBuf::from("/dev/nvme0n1"),
            ));
        }
        config
    }

    fn provisioner(&self, fail_volume: Option<&str>) -> Arc<RecordingProvisioner> {
        Arc::new(RecordingProvisioner {
            events: self.events.clone(),
            fail_volume: fail_volume.map(String::from),
            broken_environment: false,
            exports: AtomicUsize::new(0),
        })
    }

    fn connector(&self, unreachable: Option<u16>) -> Arc<FakeConnector> {
        Arc::new(FakeConnector {
            unreachable,
            session: self.session.clone(),
        })
    }

    fn orchestrator(
        &self,
        config: RunConfig,
        provisioner: Option<Arc<RecordingProvisioner>>,
        unreachable: Option<u16>,
    ) -> Orchestrator {
        Orchestrator::new(
            config,
            Collaborators {
                hypervisor: self.hypervisor.clone(),
                connector: self.connector(unreachable),
                provisioner: provisioner.map(|p| p as Arc<dyn StorageProvisioner>),
                workload: self.workload.clone(),
                host: Arc::new(HostOk),
            },
        )
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn run_dirs(&self) -> Vec<PathBuf> {
        fs::read_dir(self.tmp.as_path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.is_dir())
            .collect()
    }

    fn report(&self) -> serde_json::Value {
        let run_dirs = self.run_dirs();
        assert_eq!(run_dirs.len(), 1);
        let text = fs::read_to_string(run_dirs[0].join(REPORT_FILE)).unwrap();
        serde_json::from_str(&text).unwrap()
    }
}

fn count(events: &[String], prefix: &str) -> usize {
    events.iter().filter(|e| e.starts_with(prefix)).count()
}

#[test]
fn test_happy_path() {
    let h = Harness::new(Behavior::Succeed);
    let config = h.config(1, false);
    assert_eq!(config.matrix.test_count(), 8);

    let report = h.orchestrator(config, None, None).run(&CancelToken::new()).unwrap();
    assert!(report.succeeded());
    assert_eq!(report.test_count, 8);
    assert_eq!(report.timeout_secs, 13);
    assert_eq!(report.vms.len(), 1);
    assert!(report.teardown.is_clean());

    let run_dirs = h.run_dirs();
    assert_eq!(run_dirs.len(), 1);
    let vm_dirs: Vec<PathBuf> = fs::read_dir(&run_dirs[0])
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_dir())
        .collect();
    assert_eq!(vm_dirs, vec![run_dirs[0].join("vm-port-6666")]);
    assert!(vm_dirs[0].join("qemu.cfg").exists());
    assert!(vm_dirs[0].join("result.json").exists());

    let json = h.report();
    assert_eq!(json["outcome"], "completed");
    assert_eq!(json["vms"][0]["state"], "Completed");

    assert_eq!(*h.hypervisor.started.lock().unwrap(), vec![6666]);
    assert_eq!(h.hypervisor.stopped.load(Ordering::SeqCst), 1);
    assert!(h.session.closed.load(Ordering::SeqCst) >= 1);
    // The single VM boots from the base image
    assert!(!h.tmp.as_path().join("0-focal.img").exists());
}

#[test]
fn test_provisioning_failure_rolls_back_pool() {
    let h = Harness::new(Behavior::Succeed);
    let provisioner = h.provisioner(Some("vm6667"));
    let orchestrator = h.orchestrator(h.config(3, true), Some(provisioner), None);

    let r = orchestrator.run(&CancelToken::new());
    assert!(matches!(r, Err(Error::Provision { port: 6667, .. })));

    assert_eq!(
        h.events(),
        vec![
            "create_pool fiotest",
            "create_volume vm6666",
            "export fiotest6666_iblock naa.5001405000000000",
            "unexport naa.5001405000000000",
            "delete_target fiotest6666_iblock",
            "destroy_volume vm6666",
            "destroy_pool fiotest",
        ]
    );
    assert_eq!(*h.hypervisor.started.lock().unwrap(), vec![6666]);
    assert_eq!(h.hypervisor.stopped.load(Ordering::SeqCst), 1);
    assert_eq!(h.workload.runs.load(Ordering::SeqCst), 0);
    // Private image copies of VM 0 are gone
    assert!(!h.tmp.as_path().join("0-focal.img").exists());
    assert!(!h.tmp.as_path().join("0-user-data.img").exists());

    assert_eq!(h.report()["outcome"], "failed");
}

#[test]
fn test_execution_failure_aborts_run() {
    let h = Harness::new(Behavior::FailOn(6668, Duration::from_millis(200)));
    let provisioner = h.provisioner(None);
    let config = h.config(3, true);
    let timeout = Duration::from_secs(13);
    let orchestrator = h.orchestrator(config, Some(provisioner), None);

    let start = Instant::now();
    let r = orchestrator.run(&CancelToken::new());
    assert!(start.elapsed() < timeout / 2);
    match r {
        Err(Error::Benchmark { port, .. }) => assert_eq!(port, 6668),
        Err(e) => panic!("unexpected error {e:?}"),
        Ok(_) => panic!("run unexpectedly succeeded"),
    }

    // Every VM torn down exactly once
    assert_eq!(h.hypervisor.started.lock().unwrap().len(), 3);
    assert_eq!(h.hypervisor.stopped.load(Ordering::SeqCst), 3);
    assert_eq!(h.workload.runs.load(Ordering::SeqCst), 3);
    assert_eq!(h.workload.cancelled.load(Ordering::SeqCst), 2);

    let events = h.events();
    assert_eq!(count(&events, "create_volume"), 3);
    assert_eq!(count(&events, "destroy_volume"), 3);
    assert_eq!(count(&events, "delete_target"), 3);
    assert_eq!(count(&events, "destroy_pool"), 1);
    for n in 0..3 {
        let wwpn = format!("naa.5001405{n:09x}");
        assert_eq!(
            events.iter().filter(|e| *e == &format!("unexport {wwpn}")).count(),
            1
        );
    }
    assert_eq!(events.last().unwrap(), "destroy_pool fiotest");

    let json = h.report();
    assert_eq!(json["outcome"], "failed");
    assert_eq!(json["vms"].as_array().unwrap().len(), 3);
    let wwpns: Vec<&str> = json["vms"]
        .as_array()
        .unwrap()
        .iter()
        .map(|vm| vm["wwpn"].as_str().unwrap())
        .collect();
    assert_eq!(wwpns.len(), 3);
    assert!(wwpns[0] != wwpns[1] && wwpns[1] != wwpns[2] && wwpns[0] != wwpns[2]);
}

#[test]
fn test_readiness_failure_aborts_siblings() {
    let h = Harness::new(Behavior::Succeed);
    let orchestrator = h.orchestrator(h.config(3, false), None, Some(6667));

    let r = orchestrator.run(&CancelToken::new());
    assert!(matches!(r, Err(Error::StartVm { port: 6667, .. })));
    assert_eq!(*h.hypervisor.started.lock().unwrap(), vec![6666, 6667]);
    assert_eq!(h.hypervisor.stopped.load(Ordering::SeqCst), 2);
    assert_eq!(h.workload.runs.load(Ordering::SeqCst), 0);
}

#[test]
fn test_timeout() {
    let h = Harness::new(Behavior::RunUntilCancelled);
    let mut config = h.config(1, false);
    config.matrix.set_ops("read").unwrap();
    config.matrix.set_block_sizes("4k").unwrap();
    config.matrix.set_depths("8").unwrap();
    config.timing.fixed_buffer = Duration::from_millis(300);

    let start = Instant::now();
    let r = h.orchestrator(config, None, None).run(&CancelToken::new());
    assert!(matches!(r, Err(Error::TimedOut(_))));
    assert!(start.elapsed() >= Duration::from_millis(1300));
    assert_eq!(h.workload.cancelled.load(Ordering::SeqCst), 1);
    assert_eq!(h.hypervisor.stopped.load(Ordering::SeqCst), 1);
    assert_eq!(h.report()["outcome"], "timed out");
}

#[test]
fn test_external_abort() {
    let h = Harness::new(Behavior::RunUntilCancelled);
    let orchestrator = h.orchestrator(h.config(2, true), Some(h.provisioner(None)), None);

    let cancel = CancelToken::new();
    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(300));
            cancel.cancel();
        })
    };
    let r = orchestrator.run(&cancel);
    canceller.join().unwrap();

    assert!(matches!(r, Err(Error::Aborted)));
    let events = h.events();
    assert_eq!(count(&events, "unexport"), 2);
    assert_eq!(count(&events, "destroy_pool"), 1);
    assert_eq!(h.report()["outcome"], "aborted");
}

#[test]
fn test_environment_errors_create_nothing() {
    let h = Harness::new(Behavior::Succeed);
    let provisioner = Arc::new(RecordingProvisioner {
        events: h.events.clone(),
        fail_volume: None,
        broken_environment: true,
        exports: AtomicUsize::new(0),
    });
    let r = h
        .orchestrator(h.config(2, true), Some(provisioner), None)
        .run(&CancelToken::new());
    assert!(matches!(r, Err(Error::Environment(_))));
    assert!(h.events().is_empty());
    assert!(h.run_dirs().is_empty());

    let orchestrator = Orchestrator::new(
        h.config(1, false),
        Collaborators {
            hypervisor: h.hypervisor.clone(),
            connector: h.connector(None),
            provisioner: None,
            workload: h.workload.clone(),
            host: Arc::new(HostWithoutQemu),
        },
    );
    assert!(matches!(
        orchestrator.run(&CancelToken::new()),
        Err(Error::HypervisorMissing { .. })
    ));
    assert!(h.hypervisor.started.lock().unwrap().is_empty());
}

#[test]
fn test_teardown_twice() {
    let h = Harness::new(Behavior::Succeed);
    let config = h.config(2, true);
    let provisioner = h.provisioner(None);
    let manager = VmManager::new(
        h.hypervisor.clone(),
        h.connector(None),
        config.timing.readiness,
    );
    let run_dir = h.tmp.as_path().join("run");

    let mut pool = Pool::new(Some(provisioner));
    pool.create_shared(config.storage.as_ref().unwrap()).unwrap();
    pool.allocate(&config, &manager, &run_dir, &CancelToken::new())
        .unwrap();
    assert_eq!(pool.len(), 2);
    assert!(h.tmp.as_path().join("1-focal.img").exists());

    assert!(pool.teardown().is_clean());
    let after_first = h.events();
    assert!(pool.is_empty());
    assert_eq!(h.hypervisor.stopped.load(Ordering::SeqCst), 2);
    assert!(!h.tmp.as_path().join("1-focal.img").exists());

    assert!(pool.teardown().is_clean());
    drop(pool);
    assert_eq!(h.events(), after_first);
    assert_eq!(count(&after_first, "destroy_volume"), 2);
    assert_eq!(count(&after_first, "destroy_pool"), 1);
}
