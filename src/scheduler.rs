// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Rate-capped, signal-driven update worker.
//!
//! The worker wakes at most `rate_source()` times per second while there is
//! work, and not at all while there is none: after the action reports that it
//! sent nothing, the next cycle waits on the signal alone. The rate is an
//! upper bound on wakeups, not a target; work is driven by explicit signals
//! from framebuffer changes and update requests.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time;

/// Longest wait between timer wakeups, used when the sampled rate would
/// produce a period too large for a `Duration`.
const MAX_PERIOD: Duration = Duration::from_secs(86_400);

/// Handle to the periodic update worker task.
pub(crate) struct UpdateScheduler {
    signal: Arc<Notify>,
    shutdown: Arc<Notify>,
    worker: JoinHandle<()>,
}

impl UpdateScheduler {
    /// Spawns the worker.
    ///
    /// `action` runs once per wakeup and returns whether it sent anything;
    /// `rate_source` is sampled before every timed wait so rate changes take
    /// effect on the next cycle. With `fire_immediately` the action runs once
    /// before the first wait.
    pub(crate) fn start<A, F, R>(
        signal: Arc<Notify>,
        action: A,
        rate_source: R,
        fire_immediately: bool,
    ) -> Self
    where
        A: Fn() -> F + Send + 'static,
        F: Future<Output = bool> + Send + 'static,
        R: Fn() -> f64 + Send + 'static,
    {
        let shutdown = Arc::new(Notify::new());
        let worker = tokio::spawn(run_worker(
            signal.clone(),
            shutdown.clone(),
            action,
            rate_source,
            fire_immediately,
        ));
        Self {
            signal,
            shutdown,
            worker,
        }
    }

    /// Wakes the worker. Edge-triggered and idempotent: signals delivered
    /// between two wakeups collapse into a single work cycle. The shared
    /// `Notify` handed to [`start`](Self::start) reaches the same waiter, so
    /// callers without the scheduler handle can signal through that instead.
    #[allow(dead_code)]
    pub(crate) fn signal(&self) {
        self.signal.notify_one();
    }

    /// Stops the worker and waits for it to exit. The action is never
    /// interrupted mid-run.
    pub(crate) async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.worker.await;
        debug!("update scheduler stopped");
    }
}

async fn run_worker<A, F, R>(
    signal: Arc<Notify>,
    shutdown: Arc<Notify>,
    action: A,
    rate_source: R,
    fire_immediately: bool,
) where
    A: Fn() -> F,
    F: Future<Output = bool>,
    R: Fn() -> f64,
{
    let mut idle = false;
    if fire_immediately {
        idle = !action().await;
    }

    loop {
        if idle {
            tokio::select! {
                _ = signal.notified() => {}
                _ = shutdown.notified() => break,
            }
        } else {
            tokio::select! {
                _ = signal.notified() => {}
                _ = time::sleep(cycle_period(rate_source())) => {}
                _ = shutdown.notified() => break,
            }
        }
        idle = !action().await;
    }
}

fn cycle_period(rate: f64) -> Duration {
    let seconds = 1.0 / rate;
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds.min(MAX_PERIOD.as_secs_f64()))
    } else {
        MAX_PERIOD
    }
}
