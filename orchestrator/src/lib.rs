// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Benchmark runs: a pool of VMs, each with its own exported volume,
//! running the fio matrix concurrently until completion, first failure or
//! timeout, then torn down.

pub mod config;
pub mod monitor;
pub mod pool;
pub mod report;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bench_infra::{CancelToken, Connector, HostCommandError, HostExec};
use chrono::Local;
use fio_bench::{BenchmarkMatrix, FioWorkload, Workload};
use log::{error, info};
use storage_backend::StorageProvisioner;
use thiserror::Error;
use vm_manager::{Hypervisor, VmManager};

pub use config::{RunConfig, StorageConfig, Timing};
pub use monitor::{dispatch, monitor, FailureSignal, MonitorOutcome, WorkerFailure, Workers};
pub use pool::{Pool, TeardownReport};
pub use report::{RunReport, VmReport, REPORT_FILE};

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read configuration {path}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse configuration {path}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid benchmark matrix")]
    Matrix(#[source] fio_bench::Error),
    #[error("hypervisor {binary} is not usable")]
    HypervisorMissing {
        binary: PathBuf,
        #[source]
        source: HostCommandError,
    },
    #[error("storage environment check failed")]
    Environment(#[source] storage_backend::Error),
    #[error("failed to create the storage pool")]
    CreatePool(#[source] storage_backend::Error),
    #[error("failed to create result directory {path}")]
    ResultDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to provision storage for VM localhost:{port}")]
    Provision {
        port: u16,
        #[source]
        source: storage_backend::Error,
    },
    #[error("failed to start VM localhost:{port}")]
    StartVm {
        port: u16,
        #[source]
        source: vm_manager::Error,
    },
    #[error("benchmark on VM localhost:{port} failed")]
    Benchmark {
        port: u16,
        #[source]
        source: fio_bench::Error,
    },
    #[error("benchmark did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("run aborted")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Upper bound for a whole run: every test of the matrix back to back plus
/// `fixed_buffer`. VMs run in parallel, so the pool size does not count.
pub fn compute_timeout(matrix: &BenchmarkMatrix, fixed_buffer: Duration) -> Duration {
    matrix.expected_duration().saturating_add(fixed_buffer)
}

/// Creates `FIO-results-QEMU-Target<timestamp>` under `root`.
pub fn create_run_dir(root: &Path) -> Result<PathBuf> {
    let dir = root.join(format!(
        "FIO-results-QEMU-Target{}",
        Local::now().format("%Y-%m-%d-%H:%M:%S")
    ));
    fs::create_dir_all(&dir).map_err(|source| Error::ResultDir {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}

/// The fio workload described by `config`.
pub fn fio_workload(config: &RunConfig, host: Arc<dyn HostExec>) -> FioWorkload {
    let mut workload = FioWorkload::new(config.fio_matrix(), host)
        .with_verify(config.verify.clone())
        .with_timing(config.timing.heartbeat_interval, config.timing.finish_grace);
    if let Some(target) = &config.fio_target {
        workload = workload.with_target(target);
    }
    workload
}

/// Collaborators the orchestrator drives.
pub struct Collaborators {
    pub hypervisor: Arc<dyn Hypervisor>,
    pub connector: Arc<dyn Connector>,
    /// Required when the configuration asks for storage.
    pub provisioner: Option<Arc<dyn StorageProvisioner>>,
    pub workload: Arc<dyn Workload>,
    pub host: Arc<dyn HostExec>,
}

pub struct Orchestrator {
    config: RunConfig,
    vms: VmManager,
    provisioner: Option<Arc<dyn StorageProvisioner>>,
    workload: Arc<dyn Workload>,
    host: Arc<dyn HostExec>,
}

/// Resources of a run in progress.
struct Run {
    ctx: CancelToken,
    pool: Pool,
    workers: Option<Workers>,
}

impl Run {
    /// Stops the VMs, which unblocks the workers, then waits for the
    /// workers.
    fn teardown(&mut self) -> TeardownReport {
        self.ctx.cancel();
        let report = self.pool.teardown();
        if let Some(workers) = self.workers.take() {
            workers.join();
        }
        report
    }
}

impl Orchestrator {
    pub fn new(config: RunConfig, collaborators: Collaborators) -> Self {
        let vms = VmManager::new(
            collaborators.hypervisor,
            collaborators.connector,
            config.timing.readiness,
        );
        Orchestrator {
            config,
            vms,
            provisioner: collaborators.provisioner,
            workload: collaborators.workload,
            host: collaborators.host,
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Checks run once before anything is created.
    fn check_environment(&self) -> Result<()> {
        let binary = &self.config.vm.qemu_binary;
        self.host
            .exec(&binary.to_string_lossy(), &["--version"])
            .map_err(|source| Error::HypervisorMissing {
                binary: binary.clone(),
                source,
            })?;

        if self.config.storage.is_some() {
            let provisioner = self.provisioner.as_ref().ok_or_else(|| {
                Error::InvalidConfig(String::from("storage requested without a provisioner"))
            })?;
            provisioner.check_environment().map_err(Error::Environment)?;
        }
        Ok(())
    }

    /// Runs the benchmark on a fresh pool of VMs.
    ///
    /// `cancel` aborts the run from outside. Whatever happens, every VM and
    /// every volume is torn down before this returns. The run report is
    /// written to the run directory and returned on success.
    pub fn run(&self, cancel: &CancelToken) -> Result<RunReport> {
        self.config.validate()?;
        let matrix = &self.config.matrix;
        let timeout = compute_timeout(matrix, self.config.timing.fixed_buffer);
        info!(
            "Total generated tests: {}, timeout {}s",
            matrix.test_count(),
            timeout.as_secs()
        );

        self.check_environment()?;
        let run_dir = create_run_dir(&self.config.results_root)?;
        info!("Results go to {}", run_dir.display());

        let mut report = RunReport::new(&run_dir, matrix.test_count(), timeout);
        let mut run = Run {
            ctx: cancel.child_with_timeout(timeout),
            pool: Pool::new(self.provisioner.clone()),
            workers: None,
        };

        let result = self.execute(&mut run, &run_dir, &mut report);
        let teardown = run.teardown();
        if !teardown.is_clean() {
            error!("Teardown finished with {} errors", teardown.errors.len());
        }

        let outcome = match &result {
            Ok(()) => "completed",
            Err(Error::TimedOut(_)) => "timed out",
            Err(Error::Aborted) => "aborted",
            Err(_) => "failed",
        };
        report.finish(outcome, result.as_ref().err().map(|e| e.to_string()), teardown);
        report.write();

        result.map(|()| report)
    }

    fn execute(&self, run: &mut Run, run_dir: &Path, report: &mut RunReport) -> Result<()> {
        if let Some(storage) = &self.config.storage {
            run.pool.create_shared(storage)?;
        }
        run.pool.allocate(&self.config, &self.vms, run_dir, &run.ctx)?;

        let workers = dispatch(
            &run.pool,
            self.workload.clone(),
            self.config.timing.dispatch_stagger,
            &run.ctx,
        );
        let deadline = run
            .ctx
            .deadline()
            .unwrap_or_else(|| Instant::now() + self.config.timing.fixed_buffer);
        let outcome = monitor(
            &workers,
            deadline,
            self.config.timing.heartbeat_interval,
            &run.ctx,
        );
        run.workers = Some(workers);
        report.record_vms(&run.pool);

        match outcome {
            MonitorOutcome::Completed => {
                info!("All FIO tests finished");
                Ok(())
            }
            MonitorOutcome::Failed(WorkerFailure { port, error }) => Err(Error::Benchmark {
                port,
                source: error,
            }),
            MonitorOutcome::TimedOut => Err(Error::TimedOut(
                compute_timeout(&self.config.matrix, self.config.timing.fixed_buffer),
            )),
            MonitorOutcome::Aborted => Err(Error::Aborted),
        }
    }
}
