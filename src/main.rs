// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::Context;
use autobench::{cancel_on_signals, cli_print_error_chain};
use bench_infra::{CancelToken, HostExec, PasswordConnector, SystemExec};
use clap::{ArgGroup, Args, Parser, Subcommand};
use log::{info, LevelFilter};
use orchestrator::{fio_workload, Collaborators, Orchestrator, RunConfig, StorageConfig};
use storage_backend::{BackendKind, HostProvisioner, StorageProvisioner};
use vm_manager::Qemu;

#[derive(Debug, Parser)]
#[command(name = "autobench", version, author)]
/// Runs fio benchmarks on a pool of ephemeral QEMU VMs, each backed by
/// its own ZFS or LVM volume exported over vhost-scsi.
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the benchmark matrix on a fresh pool of VMs
    Run(RunArgs),
    /// Convert a fio JSON result to CSV
    Csv(CsvArgs),
}

#[derive(Debug, Args)]
#[command(group = ArgGroup::new("backend").args(["zfs", "lvm"]))]
struct RunArgs {
    /// JSON run configuration; the flags below override it
    #[arg(long, short)]
    config: Option<PathBuf>,
    /// Number of VMs to run in parallel
    #[arg(long = "vms", short = 'n')]
    pool_size: Option<usize>,
    /// SSH port forwarded to the first VM
    #[arg(long, short)]
    port: Option<u16>,
    /// QEMU binary
    #[arg(long)]
    qemu: Option<PathBuf>,
    /// Base VM image
    #[arg(long, short)]
    image: Option<PathBuf>,
    /// cloud-init seed image
    #[arg(long)]
    seed: Option<PathBuf>,
    /// Format of the base image
    #[arg(long)]
    format: Option<String>,
    #[arg(long)]
    vcpus: Option<u32>,
    /// Guest memory in MiB
    #[arg(long)]
    memory: Option<u64>,
    /// Guest user
    #[arg(long, short)]
    user: Option<String>,
    /// Guest password
    #[arg(long)]
    password: Option<String>,
    /// Carve the volumes from a ZFS pool built on --device
    #[arg(long)]
    zfs: bool,
    /// Carve the volumes from an LVM volume group built on --device
    #[arg(long)]
    lvm: bool,
    /// Physical device backing the volumes
    #[arg(long, short)]
    device: Option<PathBuf>,
    /// Volume size in GiB
    #[arg(long)]
    size: Option<u64>,
    /// Operation types, e.g. "read,randwrite"
    #[arg(long = "type", short = 't')]
    ops: Option<String>,
    /// Block sizes, e.g. "4k,64k,1m"
    #[arg(long)]
    bs: Option<String>,
    /// IO depths, e.g. "8,16,32"
    #[arg(long)]
    iodepth: Option<String>,
    /// Job counts, e.g. "1,8"
    #[arg(long)]
    jobs: Option<String>,
    /// Runtime of each test in seconds
    #[arg(long)]
    time: Option<u64>,
    /// Check data integrity with the given verify algorithm
    #[arg(long = "check")]
    verify: Option<String>,
    /// Device fio runs against inside the guest
    #[arg(long)]
    target: Option<String>,
    /// Directory the run's results directory is created in
    #[arg(long, short)]
    results: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct CsvArgs {
    /// fio JSON result
    #[arg(long, short)]
    file: PathBuf,
    /// Name of the CSV file to write
    #[arg(long, short, default_value = "FIOresult.csv")]
    name: PathBuf,
}

impl RunArgs {
    fn backend(&self) -> Option<BackendKind> {
        if self.zfs {
            Some(BackendKind::Zfs)
        } else if self.lvm {
            Some(BackendKind::Lvm)
        } else {
            None
        }
    }

    fn apply(self, config: &mut RunConfig) -> anyhow::Result<()> {
        if let Some(kind) = self.backend() {
            let device = self
                .device
                .clone()
                .or_else(|| config.storage.as_ref().map(|s| s.device.clone()))
                .context("--zfs and --lvm need a --device")?;
            let mut storage = StorageConfig::new(kind, device);
            if let Some(previous) = &config.storage {
                storage.pool.clone_from(&previous.pool);
                storage.size_gib = previous.size_gib;
            }
            config.storage = Some(storage);
        } else if let (Some(device), Some(storage)) = (&self.device, &mut config.storage) {
            storage.device.clone_from(device);
        }
        if let (Some(size), Some(storage)) = (self.size, &mut config.storage) {
            storage.size_gib = size;
        }

        if let Some(n) = self.pool_size {
            config.pool_size = n;
        }
        if let Some(port) = self.port {
            config.base_port = port;
        }
        if let Some(qemu) = self.qemu {
            config.vm.qemu_binary = qemu;
        }
        if let Some(image) = self.image {
            config.vm.image = image;
        }
        if let Some(seed) = self.seed {
            config.vm.seed_image = seed;
        }
        if let Some(format) = self.format {
            config.vm.format = format;
        }
        if let Some(vcpus) = self.vcpus {
            config.vm.vcpus = vcpus;
        }
        if let Some(memory) = self.memory {
            config.vm.memory_mib = memory;
        }
        if let Some(user) = self.user {
            config.credentials.username = user;
        }
        if let Some(password) = self.password {
            config.credentials.password = password;
        }

        let matrix = &mut config.matrix;
        if let Some(ops) = &self.ops {
            matrix.set_ops(ops).context("invalid --type")?;
        }
        if let Some(bs) = &self.bs {
            matrix.set_block_sizes(bs).context("invalid --bs")?;
        }
        if let Some(depths) = &self.iodepth {
            matrix.set_depths(depths).context("invalid --iodepth")?;
        }
        if let Some(jobs) = &self.jobs {
            matrix.set_jobs(jobs).context("invalid --jobs")?;
        }
        if let Some(time) = self.time {
            matrix.runtime_secs = time;
        }

        if self.verify.is_some() {
            config.verify = self.verify;
        }
        if self.target.is_some() {
            config.fio_target = self.target;
        }
        if let Some(results) = self.results {
            config.results_root = results;
        }
        Ok(())
    }
}

fn run(args: RunArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => RunConfig::from_file(path)?,
        None => RunConfig::default(),
    };
    args.apply(&mut config)?;

    let host: Arc<dyn HostExec> = Arc::new(SystemExec);
    let provisioner = config.storage.as_ref().map(|storage| {
        Arc::new(HostProvisioner::new(storage.kind, host.clone())) as Arc<dyn StorageProvisioner>
    });
    let collaborators = Collaborators {
        hypervisor: Arc::new(Qemu::new(&config.vm.qemu_binary)),
        connector: Arc::new(PasswordConnector {
            auth: config.credentials.clone(),
        }),
        provisioner,
        workload: Arc::new(fio_workload(&config, host.clone())),
        host,
    };

    let cancel = CancelToken::new();
    cancel_on_signals(&cancel).context("failed to install signal handlers")?;

    let orchestrator = Orchestrator::new(config, collaborators);
    let report = orchestrator.run(&cancel)?;
    info!(
        "Benchmark finished, results in {}",
        report.results_dir.display()
    );
    Ok(())
}

fn csv(args: CsvArgs) -> anyhow::Result<()> {
    let rows = fio_bench::convert_json_to_csv(&args.file, &args.name)
        .with_context(|| format!("failed to convert {}", args.file.display()))?;
    info!("Wrote {rows} rows to {}", args.name.display());
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let r = match cli.command {
        Command::Run(args) => run(args),
        Command::Csv(args) => csv(args),
    };

    if let Err(e) = r {
        cli_print_error_chain(e.as_ref(), "autobench");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    fn parse_run(args: &[&str]) -> RunArgs {
        let cli = Cli::try_parse_from(std::iter::once("autobench").chain(args.iter().copied()))
            .unwrap();
        match cli.command {
            Command::Run(args) => args,
            c => panic!("unexpected command {c:?}"),
        }
    }

    #[test]
    fn test_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_overrides() {
        let args = parse_run(&[
            "run", "-n", "3", "--zfs", "--device", "/dev/nvme0n1", "--size", "20", "--type",
            "randread", "--bs", "4k", "--iodepth", "8", "--jobs", "1", "--time", "30",
            "--check", "crc32c",
        ]);
        let mut config = RunConfig::default();
        args.apply(&mut config).unwrap();

        assert_eq!(config.pool_size, 3);
        let storage = config.storage.unwrap();
        assert_eq!(storage.kind, BackendKind::Zfs);
        assert_eq!(storage.device, PathBuf::from("/dev/nvme0n1"));
        assert_eq!(storage.size_gib, 20);
        assert_eq!(storage.pool, "fiotest");
        assert_eq!(config.matrix.test_count(), 1);
        assert_eq!(config.matrix.runtime_secs, 30);
        assert_eq!(config.verify.as_deref(), Some("crc32c"));
    }

    #[test]
    fn test_run_rejects_bad_values() {
        let mut config = RunConfig::default();
        let args = parse_run(&["run", "--lvm"]);
        assert!(args.apply(&mut config).is_err());

        let args = parse_run(&["run", "--bs", "3k"]);
        assert!(args.apply(&mut config).is_err());

        assert!(Cli::try_parse_from(["autobench", "run", "--zfs", "--lvm"]).is_err());
    }
}
