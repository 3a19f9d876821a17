// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bench_infra::{CancelToken, HostExec, RemoteSession, SshCommandError};
use log::{info, warn};

use crate::jobfile::{render_job_file, DEFAULT_TARGET};
use crate::matrix::BenchmarkMatrix;
use crate::results::convert_json_to_csv;
use crate::{Error, Result, Workload};

pub const JOB_FILE: &str = "fio_config.cfg";
pub const RESULT_FILE: &str = "result.json";
pub const CSV_FILE: &str = "FIOresult.csv";
pub const GUEST_DMESG_FILE: &str = "guest_dmesg";
pub const HOST_DMESG_FILE: &str = "host_dmesg";
pub const LSHW_FILE: &str = "lshw-result";

const INSTALL_COMMAND: &str = "apt-get update && apt-get install -y fio lshw sysstat";
const FIO_ALIVE_COMMAND: &str = "pgrep -x fio";
const GUEST_DMESG: &str = "/var/log/dmesg";
const FINISH_POLL: Duration = Duration::from_secs(1);

/// Runs the fio matrix on a guest and collects its results.
pub struct FioWorkload {
    matrix: BenchmarkMatrix,
    target: String,
    verify: Option<String>,
    remote_dir: PathBuf,
    heartbeat: Duration,
    finish_grace: Duration,
    host: Arc<dyn HostExec>,
}

impl FioWorkload {
    pub fn new(matrix: BenchmarkMatrix, host: Arc<dyn HostExec>) -> Self {
        FioWorkload {
            matrix,
            target: String::from(DEFAULT_TARGET),
            verify: None,
            remote_dir: PathBuf::from("/tmp/autobench"),
            heartbeat: Duration::from_secs(60),
            finish_grace: Duration::from_secs(60),
            host,
        }
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = target.to_string();
        self
    }

    pub fn with_verify(mut self, verify: Option<String>) -> Self {
        self.verify = verify;
        self
    }

    pub fn with_remote_dir<P: Into<PathBuf>>(mut self, remote_dir: P) -> Self {
        self.remote_dir = remote_dir.into();
        self
    }

    /// Interval of the liveness checks while fio runs, and how long fio may
    /// keep running past the expected end of the matrix.
    pub fn with_timing(mut self, heartbeat: Duration, finish_grace: Duration) -> Self {
        self.heartbeat = heartbeat;
        self.finish_grace = finish_grace;
        self
    }

    pub fn matrix(&self) -> &BenchmarkMatrix {
        &self.matrix
    }

    fn remote(step: &'static str) -> impl FnOnce(SshCommandError) -> Error {
        move |source| Error::Remote { step, source }
    }

    /// Pushes the job file and starts fio in the background.
    fn start_fio(&self, session: &dyn RemoteSession, result_dir: &Path) -> Result<()> {
        if let Err(e) = session.run_command(INSTALL_COMMAND, true) {
            warn!("Could not install the benchmark tools: {e}");
        }

        let job = render_job_file(&self.matrix, &self.target, self.verify.as_deref());
        let local_job = result_dir.join(JOB_FILE);
        fs::write(&local_job, &job.text).map_err(|source| Error::Io {
            path: local_job.clone(),
            source,
        })?;

        session
            .run_command(
                &format!("mkdir -p {}", self.remote_dir.display()),
                true,
            )
            .map_err(Self::remote("create the result directory"))?;
        let remote_job = self.remote_dir.join(JOB_FILE);
        session
            .push_file(&local_job, &remote_job)
            .map_err(Self::remote("upload the job file"))?;

        session
            .run_command(
                &format!(
                    "fio {} --output-format=json --output={}",
                    remote_job.display(),
                    self.remote_dir.join(RESULT_FILE).display()
                ),
                false,
            )
            .map_err(Self::remote("start fio"))?;
        info!(
            "Started {} fio tests, results in {}",
            job.test_count,
            result_dir.display()
        );
        Ok(())
    }

    fn fio_running(session: &dyn RemoteSession) -> Result<bool> {
        match session.run_command(FIO_ALIVE_COMMAND, true) {
            Ok(_) => Ok(true),
            // pgrep exits with 1 when nothing matches
            Err(SshCommandError::NonZeroExitStatus(_)) => Ok(false),
            Err(source) => Err(Error::Remote {
                step: "check on fio",
                source,
            }),
        }
    }

    /// Checks on fio every heartbeat until the matrix should be done. fio
    /// disappearing before that is a failure.
    fn heartbeat(&self, session: &dyn RemoteSession, cancel: &CancelToken) -> Result<()> {
        let expected = self.matrix.expected_duration();
        let start = Instant::now();

        loop {
            let elapsed = start.elapsed();
            if elapsed >= expected {
                return Ok(());
            }
            if !cancel.sleep(self.heartbeat.min(expected - elapsed)) {
                return Err(Error::Cancelled);
            }
            let elapsed = start.elapsed();
            if elapsed >= expected {
                return Ok(());
            }
            if !Self::fio_running(session)? {
                return Err(Error::FioNotRunning(elapsed));
            }
            info!(
                "fio still running ({}s of {}s)",
                elapsed.as_secs(),
                expected.as_secs()
            );
        }
    }

    fn wait_for_exit(&self, session: &dyn RemoteSession, cancel: &CancelToken) -> Result<()> {
        let deadline = Instant::now() + self.finish_grace;
        while Self::fio_running(session)? {
            if Instant::now() >= deadline {
                return Err(Error::FioHung(self.finish_grace));
            }
            if !cancel.sleep(FINISH_POLL.min(self.heartbeat)) {
                return Err(Error::Cancelled);
            }
        }
        Ok(())
    }

    /// Diagnostics that never fail the benchmark.
    fn collect_diagnostics(&self, session: &dyn RemoteSession, result_dir: &Path) {
        if let Err(e) = session.pull_file(Path::new(GUEST_DMESG), &result_dir.join(GUEST_DMESG_FILE))
        {
            warn!("Could not download the guest dmesg: {e}");
        }

        if let Err(e) = convert_json_to_csv(
            &result_dir.join(RESULT_FILE),
            &result_dir.join(CSV_FILE),
        ) {
            warn!("Could not convert fio results to CSV: {e}");
        }

        for (program, file) in [("lshw", LSHW_FILE), ("dmesg", HOST_DMESG_FILE)] {
            let output = match self.host.exec(program, &[]) {
                Ok(output) => output,
                Err(e) => {
                    warn!("Could not capture host {program}: {e}");
                    continue;
                }
            };
            if let Err(e) = fs::write(result_dir.join(file), output) {
                warn!("Could not save host {program}: {e}");
            }
        }
    }
}

impl Workload for FioWorkload {
    fn run(
        &self,
        session: &dyn RemoteSession,
        result_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        self.start_fio(session, result_dir)?;
        self.heartbeat(session, cancel)?;
        self.wait_for_exit(session, cancel)?;

        session
            .pull_file(&self.remote_dir.join(RESULT_FILE), &result_dir.join(RESULT_FILE))
            .map_err(Self::remote("download result.json"))?;

        self.collect_diagnostics(session, result_dir);
        info!("fio finished, results in {}", result_dir.display());
        Ok(())
    }
}
