// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs::{self, File};
use std::io;
use std::path::Path;

use log::{debug, error};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Latency {
    pub mean: f64,
}

/// Per direction statistics of one fio job.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FioStats {
    pub io_bytes: u64,
    /// KiB/s
    pub bw: u64,
    pub iops: f64,
    /// Milliseconds
    pub runtime: u64,
    pub total_ios: u64,
    pub lat_ns: Latency,
}

impl FioStats {
    /// Bytes per second, `None` when the job did no I/O in this direction.
    pub fn bandwidth(&self) -> Option<f64> {
        if self.runtime == 0 {
            return None;
        }
        Some(self.io_bytes as f64 / (self.runtime as f64 / 1000_f64))
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub rw: Option<String>,
    pub bs: Option<String>,
    pub iodepth: Option<String>,
    pub numjobs: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FioJob {
    pub jobname: String,
    #[serde(rename = "job options")]
    pub job_options: JobOptions,
    pub read: FioStats,
    pub write: FioStats,
}

impl FioJob {
    pub fn stats(&self, direction: Direction) -> &FioStats {
        match direction {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FioReport {
    #[serde(rename = "fio version")]
    pub fio_version: Option<String>,
    pub jobs: Vec<FioJob>,
}

impl FioReport {
    fn non_empty(&self) -> Result<&[FioJob]> {
        if self.jobs.is_empty() {
            return Err(Error::EmptyReport);
        }
        Ok(&self.jobs)
    }

    /// Sum of the bandwidth of every job, in bytes per second.
    pub fn total_bandwidth(&self, direction: Direction) -> Result<f64> {
        Ok(self
            .non_empty()?
            .iter()
            .filter_map(|j| j.stats(direction).bandwidth())
            .sum())
    }

    pub fn total_iops(&self, direction: Direction) -> Result<f64> {
        Ok(self
            .non_empty()?
            .iter()
            .map(|j| j.stats(direction).iops)
            .sum())
    }
}

/// Parses the JSON output of fio. fio may print notices ahead of the JSON
/// document; those are skipped.
pub fn parse_report(output: &str) -> Result<FioReport> {
    let json = output.find('{').map_or(output, |start| &output[start..]);
    serde_json::from_str(json).map_err(|e| {
        error!(
            "\n\n==== Start fio output ====\n\n{output}\n\n==== End fio output ===="
        );
        Error::Parse(e)
    })
}

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    name: &'a str,
    rw: &'a str,
    bs: &'a str,
    iodepth: &'a str,
    numjobs: &'a str,
    read_iops: f64,
    read_bw_kib: u64,
    read_lat_mean_us: f64,
    write_iops: f64,
    write_bw_kib: u64,
    write_lat_mean_us: f64,
}

impl<'a> From<&'a FioJob> for CsvRow<'a> {
    fn from(job: &'a FioJob) -> Self {
        let opt = |o: &'a Option<String>| o.as_deref().unwrap_or("");
        CsvRow {
            name: &job.jobname,
            rw: opt(&job.job_options.rw),
            bs: opt(&job.job_options.bs),
            iodepth: opt(&job.job_options.iodepth),
            numjobs: opt(&job.job_options.numjobs),
            read_iops: job.read.iops,
            read_bw_kib: job.read.bw,
            read_lat_mean_us: job.read.lat_ns.mean / 1000_f64,
            write_iops: job.write.iops,
            write_bw_kib: job.write.bw,
            write_lat_mean_us: job.write.lat_ns.mean / 1000_f64,
        }
    }
}

/// Writes one CSV row per fio job, headers first.
pub fn write_csv<W: io::Write>(report: &FioReport, writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for job in &report.jobs {
        wtr.serialize(CsvRow::from(job)).map_err(Error::Csv)?;
    }
    wtr.flush().map_err(|e| Error::Csv(e.into()))
}

/// Converts the fio JSON result at `input` into a CSV table at `output`.
/// Returns the number of rows written.
pub fn convert_json_to_csv(input: &Path, output: &Path) -> Result<usize> {
    let text = fs::read_to_string(input).map_err(|source| Error::Io {
        path: input.to_path_buf(),
        source,
    })?;
    let report = parse_report(&text)?;
    let file = File::create(output).map_err(|source| Error::Io {
        path: output.to_path_buf(),
        source,
    })?;
    write_csv(&report, file)?;
    debug!(
        "Converted {} fio jobs from {} to {}",
        report.jobs.len(),
        input.display(),
        output.display()
    );
    Ok(report.jobs.len())
}
