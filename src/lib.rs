// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bench_infra::CancelToken;
use log::warn;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::flag;
use signal_hook::iterator::Signals;

/// Prints a chain of errors to the user in a consistent manner.
/// The user will see a clear chain of errors, followed by debug output
/// for opening issues.
pub fn cli_print_error_chain(top_error: &dyn Error, component: &str) {
    eprint!("Error: {component} exited with the following ");
    if top_error.source().is_none() {
        eprintln!("error:");
        eprintln!("  {top_error}");
    } else {
        eprintln!("chain of errors:");
        std::iter::successors(Some(top_error), |sub_error| (*sub_error).source())
            .enumerate()
            .for_each(|(level, error)| {
                eprintln!("  {level}: {error}");
            });
    }

    eprintln!();
    eprintln!("Debug Info: {top_error:?}");
}

/// Cancels `cancel` on the first SIGINT or SIGTERM so the run tears
/// everything down. A second signal terminates the process right away.
pub fn cancel_on_signals(cancel: &CancelToken) -> std::io::Result<()> {
    let received = Arc::new(AtomicBool::new(false));
    for &sig in TERM_SIGNALS {
        flag::register_conditional_shutdown(sig, 1, received.clone())?;
        flag::register(sig, received.clone())?;
    }

    let mut signals = Signals::new(TERM_SIGNALS)?;
    let cancel = cancel.clone();
    thread::Builder::new()
        .name(String::from("signals"))
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                warn!("Received signal {sig}, aborting the run");
                received.store(true, Ordering::SeqCst);
                cancel.cancel();
            }
        })?;
    Ok(())
}
