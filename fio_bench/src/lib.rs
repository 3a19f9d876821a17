// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! FIO test matrix, job files, result conversion and the per-VM benchmark
//! workload.

pub mod jobfile;
pub mod matrix;
pub mod results;
pub mod workload;

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bench_infra::{CancelToken, RemoteSession, SshCommandError};
use thiserror::Error;

pub use jobfile::{render_job_file, JobFile, DEFAULT_TARGET};
pub use matrix::{BenchmarkMatrix, BlockSize, FioOps, TestCell};
pub use results::{convert_json_to_csv, parse_report, FioJob, FioReport, FioStats};
pub use workload::FioWorkload;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid {dimension} value '{value}'")]
    InvalidValue {
        dimension: &'static str,
        value: String,
    },
    #[error("no {0} value given")]
    EmptyDimension(&'static str),
    #[error("failed to {step} on the guest")]
    Remote {
        step: &'static str,
        #[source]
        source: SshCommandError,
    },
    #[error("fio is no longer running on the guest after {0:?}")]
    FioNotRunning(Duration),
    #[error("fio still running {0:?} after the expected end of the test")]
    FioHung(Duration),
    #[error("benchmark cancelled")]
    Cancelled,
    #[error("failed to access {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse fio output")]
    Parse(#[source] serde_json::Error),
    #[error("fio output has no jobs")]
    EmptyReport,
    #[error("failed to write csv")]
    Csv(#[source] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// The benchmark executed on every ready VM.
///
/// `run` blocks until the benchmark completes. Artifacts go to
/// `result_dir`, which already exists. Implementations observe `cancel`
/// between remote operations; an in-flight remote operation is aborted by
/// closing `session`.
pub trait Workload: Send + Sync {
    fn run(
        &self,
        session: &dyn RemoteSession,
        result_dir: &Path,
        cancel: &CancelToken,
    ) -> Result<()>;
}
