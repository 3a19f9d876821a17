// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::process::{Command, ExitStatus, Output};

use log::debug;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HostCommandError {
    #[error("failed to run `{command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed ({status}): {output}")]
    ExitStatus {
        command: String,
        status: ExitStatus,
        output: String,
    },
}

/// Runs a program on the host and returns its standard output.
///
/// This is the single path through which the storage provisioner touches
/// `zfs`, `zpool` and the LVM tools, so tests can record the calls instead
/// of running them.
pub trait HostExec: Send + Sync {
    fn exec(&self, program: &str, args: &[&str]) -> Result<String, HostCommandError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemExec;

impl HostExec for SystemExec {
    fn exec(&self, program: &str, args: &[&str]) -> Result<String, HostCommandError> {
        let command = command_line(program, args);
        debug!("Running host command: {command}");

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|source| HostCommandError::Spawn {
                command: command.clone(),
                source,
            })?;

        check_output(command, output)
    }
}

fn check_output(command: String, output: Output) -> Result<String, HostCommandError> {
    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(HostCommandError::ExitStatus {
        command,
        status: output.status,
        output: format!("{}{}", stdout, stderr).trim().to_string(),
    })
}

pub fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}
