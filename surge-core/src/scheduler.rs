use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{Executor, Stage};
use crate::error::{Error, Result};
use crate::gate::IterationGate;
use crate::progress::{ProgressFn, ProgressUpdate};
use crate::schedule::{StageSchedule, StageSnapshot};
use crate::scenario::{ExecutionEnv, Scenario};
use crate::vu::{VuPhase, VuReport, VuWorker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerReport {
    /// Distinct VU ids handed out.
    pub vus_used: u64,
    /// Most workers the scheduler had live at once.
    pub vus_peak: u64,
    /// One per worker, in completion order.
    pub reports: Vec<VuReport>,
}

struct LiveVu {
    id: u64,
    retire: CancellationToken,
    phase: watch::Receiver<VuPhase>,
}

/// Live workers in start order plus the tasks of every worker not yet joined.
struct Pool {
    env: Arc<ExecutionEnv>,
    scenario: Arc<dyn Scenario>,
    stop: CancellationToken,
    gate: Option<Arc<IterationGate>>,
    tasks: JoinSet<VuReport>,
    live: Vec<LiveVu>,
    next_id: u64,
    peak: u64,
    reports: Vec<VuReport>,
}

impl Pool {
    fn new(
        env: Arc<ExecutionEnv>,
        scenario: Arc<dyn Scenario>,
        stop: CancellationToken,
        gate: Option<Arc<IterationGate>>,
    ) -> Self {
        Self {
            env,
            scenario,
            stop,
            gate,
            tasks: JoinSet::new(),
            live: Vec::new(),
            next_id: 1,
            peak: 0,
            reports: Vec::new(),
        }
    }

    fn live_count(&self) -> u64 {
        self.live.len() as u64
    }

    fn sleeping_count(&self) -> u64 {
        self.live
            .iter()
            .filter(|vu| *vu.phase.borrow() == VuPhase::Sleeping)
            .count() as u64
    }

    fn spawn(&mut self) -> AbortHandle {
        let id = self.next_id;
        self.next_id += 1;

        let retire = self.stop.child_token();
        let (worker, phase) = VuWorker::new(
            id,
            self.env.clone(),
            self.scenario.clone(),
            retire.clone(),
            self.gate.clone(),
        );
        let task = self.tasks.spawn(worker.run());
        self.live.push(LiveVu { id, retire, phase });
        self.peak = self.peak.max(self.live_count());
        debug!(vu = id, live = self.live.len(), "vu spawned");
        task
    }

    /// Most recently started first. The worker drains in the background.
    fn retire_newest(&mut self) {
        if let Some(vu) = self.live.pop() {
            vu.retire.cancel();
            debug!(vu = vu.id, live = self.live.len(), "vu retired");
        }
    }

    /// Moves live size to `target`.
    fn scale_to(&mut self, target: u64) {
        while self.live_count() < target {
            let _ = self.spawn();
        }
        while self.live_count() > target {
            self.retire_newest();
        }
    }

    fn on_joined(&mut self, joined: std::result::Result<VuReport, JoinError>) -> Result<()> {
        match joined {
            Ok(report) => {
                self.live.retain(|vu| vu.id != report.vu_id);
                self.reports.push(report);
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "vu task failed");
                Err(Error::Scheduler(format!("vu task failed: {err}")))
            }
        }
    }

    /// Collects workers that already finished without waiting.
    fn reap(&mut self) -> Result<()> {
        while let Some(joined) = self.tasks.try_join_next() {
            self.on_joined(joined)?;
        }
        Ok(())
    }

    /// Signals every worker and waits for all of them; the first task failure wins.
    async fn drain(&mut self) -> Result<()> {
        for vu in self.live.drain(..) {
            vu.retire.cancel();
        }

        let mut fault = None;
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = self.on_joined(joined) {
                fault.get_or_insert(err);
            }
        }
        fault.map_or(Ok(()), Err)
    }

    /// Drains the remaining workers after a fault and hands the fault back.
    async fn fail(&mut self, fault: Error) -> Error {
        if let Err(other) = self.drain().await {
            debug!(error = %other, "further vu failure while draining");
        }
        fault
    }

    fn into_report(self) -> SchedulerReport {
        SchedulerReport {
            vus_used: self.next_id - 1,
            vus_peak: self.peak,
            reports: self.reports,
        }
    }
}

/// Spawns, retires and finally drains VU workers for one run.
pub struct Scheduler {
    env: Arc<ExecutionEnv>,
    scenario: Arc<dyn Scenario>,
    executor: Executor,
    tick: Duration,
    stop: CancellationToken,
    progress: Option<ProgressFn>,
}

impl Scheduler {
    pub fn new(
        env: Arc<ExecutionEnv>,
        scenario: Arc<dyn Scenario>,
        executor: Executor,
        tick: Duration,
        stop: CancellationToken,
    ) -> Self {
        Self {
            env,
            scenario,
            executor,
            tick,
            stop,
            progress: None,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Option<ProgressFn>) -> Self {
        self.progress = progress;
        self
    }

    pub async fn run(self) -> Result<SchedulerReport> {
        match self.executor.clone() {
            Executor::RampingVus { start_vus, stages } => self.run_ramping(start_vus, stages).await,
            Executor::ConstantVus {
                vus,
                duration,
                iterations,
            } => self.run_constant(vus, duration, iterations).await,
        }
    }

    fn interval(&self) -> tokio::time::Interval {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    fn emit(
        &self,
        pool: &Pool,
        tick: u64,
        started: Instant,
        target_vus: u64,
        stage: Option<StageSnapshot>,
    ) {
        let Some(progress) = &self.progress else {
            return;
        };
        (progress)(ProgressUpdate {
            tick,
            elapsed: started.elapsed(),
            live_vus: pool.live_count(),
            sleeping_vus: pool.sleeping_count(),
            target_vus,
            stage,
            iterations_total: self.env.builtins().iterations.iterations_total(),
        });
    }

    async fn run_ramping(&self, start_vus: u64, stages: Vec<Stage>) -> Result<SchedulerReport> {
        let schedule = StageSchedule::new(start_vus, stages);
        let mut pool = Pool::new(
            self.env.clone(),
            self.scenario.clone(),
            self.stop.clone(),
            None,
        );

        let started = Instant::now();
        let end = tokio::time::sleep_until(started + schedule.total_duration());
        tokio::pin!(end);
        let mut interval = self.interval();
        let mut tick: u64 = 0;

        info!(
            stages = schedule.stages().len(),
            duration = ?schedule.total_duration(),
            "ramping vus started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    info!(elapsed = ?started.elapsed(), "stop requested, draining vus");
                    break;
                }
                _ = &mut end => {
                    debug!("stages complete, draining vus");
                    break;
                }
                _ = interval.tick() => {}
            }

            if let Err(err) = pool.reap() {
                return Err(pool.fail(err).await);
            }

            tick += 1;
            let elapsed = started.elapsed();
            let target = schedule.target_at(elapsed);
            pool.scale_to(target);
            self.emit(
                &pool,
                tick,
                started,
                target,
                schedule.stage_snapshot_at(elapsed),
            );
        }

        pool.drain().await?;
        Ok(pool.into_report())
    }

    async fn run_constant(
        &self,
        vus: u64,
        duration: Option<Duration>,
        iterations: Option<u64>,
    ) -> Result<SchedulerReport> {
        let gate = Arc::new(IterationGate::new(iterations, duration));
        let mut pool = Pool::new(
            self.env.clone(),
            self.scenario.clone(),
            self.stop.clone(),
            Some(gate.clone()),
        );

        let started = Instant::now();
        gate.start_at(started);
        info!(vus, ?duration, ?iterations, "constant vus started");
        pool.scale_to(vus);

        let mut interval = self.interval();
        let mut tick: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    info!(elapsed = ?started.elapsed(), "stop requested, draining vus");
                    break;
                }
                joined = pool.tasks.join_next() => {
                    let Some(joined) = joined else {
                        debug!("all vus finished");
                        break;
                    };
                    if let Err(err) = pool.on_joined(joined) {
                        return Err(pool.fail(err).await);
                    }
                }
                _ = interval.tick() => {
                    tick += 1;
                    self.emit(&pool, tick, started, vus, None);
                }
            }
        }

        pool.drain().await?;
        Ok(pool.into_report())
    }
}
