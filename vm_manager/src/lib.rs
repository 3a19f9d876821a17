// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Lifecycle of the benchmark VMs: configuration, hypervisor supervision
//! and guest readiness.

pub mod config;
pub mod images;
pub mod launcher;
pub mod readiness;
mod vm;

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

pub use config::{render_config, write_config, VmParams, VmTemplate};
pub use images::{prepare_images, VmImages};
pub use launcher::{Hypervisor, LaunchSpec, Qemu};
pub use readiness::{wait_for_guest_ready, ReadinessPolicy};
pub use vm::{StateCell, VirtualMachine, VmManager, VmSpec, VmState};

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to write {path}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("image {0} does not exist")]
    ImageMissing(PathBuf),
    #[error("failed to copy image {from} to {to}")]
    ImageCopy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to run the hypervisor of VM localhost:{port}")]
    Spawn {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("hypervisor of VM localhost:{port} exited with {status}")]
    HypervisorExit { port: u16, status: ExitStatus },
    #[error("could not connect to {endpoint} after {attempts} attempts")]
    NotReady { endpoint: String, attempts: u32 },
    #[error("invalid VM state transition {from:?} -> {to:?}")]
    InvalidTransition { from: VmState, to: VmState },
    #[error("failed to start the supervisor of VM localhost:{port}")]
    Supervisor {
        port: u16,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
