use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt as _;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::gate::IterationGate;
use crate::iteration_metrics::IterationSample;
use crate::scenario::{ExecutionEnv, IterationContext, Scenario};

/// Observable lifecycle of one VU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum VuPhase {
    Idle,
    Running,
    Sleeping,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VuReport {
    pub vu_id: u64,
    pub iterations: u64,
    pub failed: u64,
}

/// Runs iterations for one VU until retired, stopped, or out of gate budget.
pub struct VuWorker {
    id: u64,
    env: Arc<ExecutionEnv>,
    scenario: Arc<dyn Scenario>,
    retire: CancellationToken,
    gate: Option<Arc<IterationGate>>,
    phase: Arc<watch::Sender<VuPhase>>,
}

impl VuWorker {
    /// `retire` is checked between iterations; pass a child of the run stop token.
    pub fn new(
        id: u64,
        env: Arc<ExecutionEnv>,
        scenario: Arc<dyn Scenario>,
        retire: CancellationToken,
        gate: Option<Arc<IterationGate>>,
    ) -> (Self, watch::Receiver<VuPhase>) {
        let (tx, rx) = watch::channel(VuPhase::Idle);
        let worker = Self {
            id,
            env,
            scenario,
            retire,
            gate,
            phase: Arc::new(tx),
        };
        (worker, rx)
    }

    fn can_start_iteration(&self) -> bool {
        if self.retire.is_cancelled() {
            return false;
        }
        self.gate.as_ref().is_none_or(|gate| gate.next())
    }

    pub async fn run(self) -> VuReport {
        let metrics = &self.env.builtins().iterations;
        let active = metrics.enter_active_vu();
        debug!(vu = self.id, "vu started");

        let mut report = VuReport {
            vu_id: self.id,
            iterations: 0,
            failed: 0,
        };

        while self.can_start_iteration() {
            self.phase.send_replace(VuPhase::Running);
            let mut ctx = IterationContext::new(self.env.clone(), self.id, report.iterations)
                .with_phase(self.phase.clone());

            let started = Instant::now();
            // The call goes inside the guard: a scenario may panic before returning its future.
            let outcome = AssertUnwindSafe(async { self.scenario.iteration(&mut ctx).await })
                .catch_unwind()
                .await;
            let duration = started.elapsed();
            drop(ctx);

            let failed = match outcome {
                Ok(Ok(())) => false,
                Ok(Err(err)) => {
                    debug!(vu = self.id, error = %err, "iteration failed");
                    true
                }
                Err(panic) => {
                    warn!(
                        vu = self.id,
                        panic = panic_message(panic.as_ref()),
                        "iteration panicked"
                    );
                    true
                }
            };

            metrics.record_iteration(IterationSample { failed, duration });
            report.iterations += 1;
            if failed {
                report.failed += 1;
            }
            self.phase.send_replace(VuPhase::Idle);

            // An iteration with no suspension point would otherwise starve the scheduler.
            tokio::task::yield_now().await;
        }

        self.phase.send_replace(VuPhase::Stopping);
        drop(active);
        debug!(
            vu = self.id,
            iterations = report.iterations,
            failed = report.failed,
            "vu stopped"
        );
        self.phase.send_replace(VuPhase::Stopped);
        report
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
