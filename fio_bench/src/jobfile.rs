// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::fmt::Write as _;

use log::info;

use crate::matrix::BenchmarkMatrix;

/// Default fio target inside the guest.
pub const DEFAULT_TARGET: &str = "/fio.test.file";

/// A rendered fio job file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobFile {
    pub text: String,
    pub test_count: usize,
}

/// Renders one stonewalled section per matrix cell after a shared
/// `[global]` section. `verify` enables fio data verification with the
/// given algorithm.
pub fn render_job_file(matrix: &BenchmarkMatrix, target: &str, verify: Option<&str>) -> JobFile {
    let mut text = String::new();

    // Writing to a String cannot fail
    let _ = writeln!(text, "[global]");
    let _ = writeln!(text, "ioengine=libaio");
    let _ = writeln!(text, "size={}", matrix.size);
    let _ = writeln!(text, "direct=1");
    let _ = writeln!(text, "runtime={}", matrix.runtime_secs);
    if let Some(alg) = verify {
        let _ = writeln!(text, "verify={alg}");
        let _ = writeln!(text, "verify_fatal=1");
    }
    let _ = writeln!(text, "time_based=1");
    let _ = writeln!(text, "group_reporting");
    let _ = writeln!(text, "filename={target}");

    for cell in matrix.cells() {
        let _ = write!(
            text,
            "\n[{}]\nrw={}\nbs={}\niodepth={}\nnumjobs={}\nstonewall\n",
            cell.name, cell.ops, cell.block_size, cell.depth, cell.jobs
        );
    }

    let test_count = matrix.test_count();
    info!(
        "fio matrix: type {:?}, bs {:?}, depth {:?}, jobs {:?}, {}s per test, {test_count} tests",
        matrix.ops.iter().map(|o| o.to_string()).collect::<Vec<_>>(),
        matrix.block_sizes.iter().map(|b| b.as_str()).collect::<Vec<_>>(),
        matrix.depths,
        matrix.jobs,
        matrix.runtime_secs,
    );

    JobFile { text, test_count }
}
