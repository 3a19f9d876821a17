// Copyright © 2026 The autobench Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;
use std::time::Duration;

use bench_infra::{CancelToken, Connector, RemoteSession, SshEndpoint};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// How long a freshly launched guest gets to accept SSH connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub dial_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        ReadinessPolicy {
            attempts: 30,
            delay: Duration::from_secs(3),
            dial_timeout: Duration::from_secs(3),
        }
    }
}

/// Polls `endpoint` until a session can be established.
///
/// Cancellation is checked between attempts; a cancelled token ends the
/// polling with the same error as running out of attempts.
pub fn wait_for_guest_ready(
    connector: &dyn Connector,
    endpoint: &SshEndpoint,
    policy: &ReadinessPolicy,
    cancel: &CancelToken,
) -> Result<Arc<dyn RemoteSession>> {
    for attempt in 1..=policy.attempts {
        if cancel.is_cancelled() {
            break;
        }

        match connector.connect(endpoint, policy.dial_timeout) {
            Ok(session) => {
                info!("Connection to {endpoint} was successful (attempt {attempt})");
                return Ok(session);
            }
            Err(e) => debug!("Unable to connect to {endpoint}: {e}"),
        }

        if attempt < policy.attempts && !cancel.sleep(policy.delay) {
            break;
        }
    }

    Err(Error::NotReady {
        endpoint: endpoint.to_string(),
        attempts: policy.attempts,
    })
}
