// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Benchmark workers and the loop watching over them.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bench_infra::CancelToken;
use fio_bench::Workload;
use flume::{Receiver, Selector, Sender, TrySendError};
use log::{debug, error, info, warn};
use vm_manager::VmState;

use crate::pool::Pool;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct WorkerFailure {
    pub port: u16,
    pub error: fio_bench::Error,
}

/// Failure reporting shared by all workers. The channel holds a single
/// failure and sending never blocks: the first failure wins and later
/// ones are dropped.
#[derive(Clone)]
pub struct FailureSignal {
    tx: Sender<WorkerFailure>,
}

impl FailureSignal {
    pub fn channel() -> (FailureSignal, Receiver<WorkerFailure>) {
        let (tx, rx) = flume::bounded(1);
        (FailureSignal { tx }, rx)
    }

    /// Returns whether the failure was recorded.
    pub fn report(&self, failure: WorkerFailure) -> bool {
        match self.tx.try_send(failure) {
            Ok(()) => true,
            Err(TrySendError::Full(f)) | Err(TrySendError::Disconnected(f)) => {
                debug!(
                    "Dropping failure of VM localhost:{}: {}",
                    f.port, f.error
                );
                false
            }
        }
    }
}

#[derive(Debug)]
pub enum MonitorOutcome {
    Completed,
    Failed(WorkerFailure),
    TimedOut,
    Aborted,
}

/// The benchmark threads of a run, one per VM.
pub struct Workers {
    handles: Vec<(u16, JoinHandle<()>)>,
    signal: FailureSignal,
    failures: Receiver<WorkerFailure>,
    done_tx: Sender<u16>,
    done_rx: Receiver<u16>,
}

impl Workers {
    pub fn new() -> Self {
        let (signal, failures) = FailureSignal::channel();
        let (done_tx, done_rx) = flume::unbounded();
        Workers {
            handles: Vec::new(),
            signal,
            failures,
            done_tx,
            done_rx,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn signal(&self) -> FailureSignal {
        self.signal.clone()
    }

    /// Waits for every worker. Workers blocked on a guest return once the
    /// VM sessions are closed.
    pub fn join(self) {
        for (port, handle) in self.handles {
            if handle.join().is_err() {
                error!("Benchmark worker of VM localhost:{port} panicked");
            }
        }
    }
}

impl Default for Workers {
    fn default() -> Self {
        Self::new()
    }
}

/// Starts `workload` on every VM of the pool, `stagger` apart.
///
/// A worker reports a failure on the shared signal; success only marks it
/// done. Dispatching stops early if `cancel` fires.
pub fn dispatch(
    pool: &Pool,
    workload: Arc<dyn Workload>,
    stagger: Duration,
    cancel: &CancelToken,
) -> Workers {
    let mut workers = Workers::new();

    for (i, vm) in pool.vms().iter().enumerate() {
        if i > 0 && !cancel.sleep(stagger) {
            warn!("Dispatch interrupted after {i} VMs");
            break;
        }

        let port = vm.port();
        let signal = workers.signal();
        let done_tx = workers.done_tx.clone();
        let state = vm.state_cell();
        let session = vm.session();
        let result_dir = vm.result_dir().to_path_buf();
        let vm_cancel = vm.cancel_token().clone();
        let workload = workload.clone();

        let spawned = thread::Builder::new()
            .name(format!("fio-{port}"))
            .spawn(move || {
                let r = match session {
                    Some(session) => {
                        let _ = state.advance(VmState::Running);
                        workload.run(session.as_ref(), &result_dir, &vm_cancel)
                    }
                    None => Err(fio_bench::Error::Cancelled),
                };
                match r {
                    Ok(()) => {
                        let _ = state.advance(VmState::Completed);
                        info!("Benchmark on VM localhost:{port} finished");
                    }
                    Err(error) => {
                        let _ = state.advance(VmState::Failed);
                        error!("Benchmark on VM localhost:{port} failed: {error}");
                        signal.report(WorkerFailure { port, error });
                    }
                }
                let _ = done_tx.send(port);
            });

        match spawned {
            Ok(handle) => workers.handles.push((port, handle)),
            Err(e) => {
                let _ = vm.state_cell().advance(VmState::Failed);
                workers.signal.report(WorkerFailure {
                    port,
                    error: fio_bench::Error::Io {
                        path: vm.result_dir().to_path_buf(),
                        source: e,
                    },
                });
            }
        }
    }

    info!("Dispatched the benchmark to {} VMs", workers.len());
    workers
}

enum Event {
    Failure(WorkerFailure),
    Done(u16),
    Disconnected,
}

/// Blocks until every worker is done, one of them fails, `deadline`
/// passes or `cancel` fires, whichever comes first. Progress is logged
/// every `heartbeat`.
pub fn monitor(
    workers: &Workers,
    deadline: Instant,
    heartbeat: Duration,
    cancel: &CancelToken,
) -> MonitorOutcome {
    let start = Instant::now();
    let total = workers.len();
    let mut finished = 0;
    let mut next_heartbeat = start + heartbeat;

    info!(
        "Monitoring {total} workers, timeout in {}s",
        deadline.saturating_duration_since(start).as_secs()
    );

    loop {
        if finished >= total {
            // A failure sent right before the last done message
            if let Ok(failure) = workers.failures.try_recv() {
                return MonitorOutcome::Failed(failure);
            }
            info!("All {total} workers finished");
            return MonitorOutcome::Completed;
        }

        let now = Instant::now();
        if now >= deadline || cancel.deadline_passed() {
            warn!("Timeout reached with {} workers still running", total - finished);
            return MonitorOutcome::TimedOut;
        }
        if cancel.is_cancelled() {
            warn!("Run aborted with {} workers still running", total - finished);
            return MonitorOutcome::Aborted;
        }
        if now >= next_heartbeat {
            info!(
                "Heartbeat: {}s elapsed, {}s until timeout, {} of {total} workers running",
                now.duration_since(start).as_secs(),
                deadline.duration_since(now).as_secs(),
                total - finished
            );
            next_heartbeat = now + heartbeat;
        }

        let wake = deadline.min(next_heartbeat).min(now + POLL_INTERVAL);
        let event = Selector::new()
            .recv(&workers.failures, |r| r.map_or(Event::Disconnected, Event::Failure))
            .recv(&workers.done_rx, |r| r.map_or(Event::Disconnected, Event::Done))
            .wait_deadline(wake);

        match event {
            Ok(Event::Failure(failure)) => {
                error!(
                    "Benchmark on VM localhost:{} failed, aborting the run",
                    failure.port
                );
                return MonitorOutcome::Failed(failure);
            }
            Ok(Event::Done(port)) => {
                finished += 1;
                debug!("Worker of VM localhost:{port} done ({finished}/{total})");
            }
            // Workers keeps a sender of each channel alive
            Ok(Event::Disconnected) => finished = total,
            Err(_) => (),
        }
    }
}
