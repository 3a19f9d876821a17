// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use log::{info, warn};
use serde::Serialize;
use vm_manager::VmState;

use crate::pool::{Pool, TeardownReport};

pub const REPORT_FILE: &str = "run-report.json";

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VmReport {
    pub port: u16,
    pub result_dir: PathBuf,
    /// State when monitoring ended.
    pub state: VmState,
    pub wwpn: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub started: DateTime<Local>,
    pub finished: Option<DateTime<Local>>,
    pub results_dir: PathBuf,
    pub test_count: usize,
    pub timeout_secs: u64,
    pub vms: Vec<VmReport>,
    pub outcome: String,
    pub error: Option<String>,
    pub teardown: TeardownReport,
}

impl RunReport {
    pub fn new(results_dir: &Path, test_count: usize, timeout: Duration) -> Self {
        RunReport {
            started: Local::now(),
            finished: None,
            results_dir: results_dir.to_path_buf(),
            test_count,
            timeout_secs: timeout.as_secs(),
            vms: Vec::new(),
            outcome: String::from("running"),
            error: None,
            teardown: TeardownReport::default(),
        }
    }

    /// Records where each VM of the pool stands.
    pub fn record_vms(&mut self, pool: &Pool) {
        self.vms = pool
            .vms()
            .iter()
            .map(|vm| VmReport {
                port: vm.port(),
                result_dir: vm.result_dir().to_path_buf(),
                state: vm.state(),
                wwpn: vm.storage().map(|s| s.wwpn.clone()),
            })
            .collect();
    }

    pub fn finish(&mut self, outcome: &str, error: Option<String>, teardown: TeardownReport) {
        self.finished = Some(Local::now());
        self.outcome = outcome.to_string();
        self.error = error;
        self.teardown = teardown;
    }

    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }

    /// Writes the report to the run directory. Failing to do so does not
    /// affect the run.
    pub fn write(&self) {
        let path = self.results_dir.join(REPORT_FILE);
        let r = serde_json::to_string_pretty(self)
            .map_err(std::io::Error::other)
            .and_then(|json| fs::write(&path, json));
        match r {
            Ok(()) => info!("Run report written to {}", path.display()),
            Err(e) => warn!("Could not write {}: {e}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use vmm_sys_util::tempdir::TempDir;

    use super::*;

    #[test]
    fn test_write_report() {
        let tmp = TempDir::new_with_prefix("/tmp/run-report").unwrap();
        let mut report = RunReport::new(tmp.as_path(), 8, Duration::from_secs(660));
        report.vms.push(VmReport {
            port: 6666,
            result_dir: tmp.as_path().join("vm-port-6666"),
            state: VmState::Completed,
            wwpn: Some(String::from("naa.5001405043a8fbf4")),
        });
        report.finish(
            "completed",
            None,
            TeardownReport {
                errors: vec![String::from("pool fiotest: busy")],
            },
        );
        assert!(report.succeeded());
        report.write();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(tmp.as_path().join(REPORT_FILE)).unwrap())
                .unwrap();
        assert_eq!(json["test_count"], 8);
        assert_eq!(json["timeout_secs"], 660);
        assert_eq!(json["outcome"], "completed");
        assert_eq!(json["vms"][0]["state"], "Completed");
        assert_eq!(json["vms"][0]["wwpn"], "naa.5001405043a8fbf4");
        assert_eq!(json["teardown"]["errors"][0], "pool fiotest: busy");
        assert!(json["finished"].is_string());
    }
}
