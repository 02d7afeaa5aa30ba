use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use offload_core::{read_document, update_document, Clock, StateStore};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::environment::{ExecutionEnvironment, ProcessEnvironment, SliceBudget};
use crate::error::SchedulerError;
use crate::job::{JobControl, JobSnapshot, JobState, JobStatus};

/// Work done for one job type, one item per call.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Process one unit. Only `Ok(true)` counts as a successful iteration.
    async fn run_iteration(&self, job_type: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How long an acquired lock (or its latest heartbeat) stays valid.
    pub lock_duration: Duration,
    /// Hard cap on iterations per slice.
    pub max_per_run: u32,
    /// Memory release hint cadence, in iterations.
    pub release_every: u32,
    pub fallback_time_limit: Duration,
    pub fallback_memory_limit: u64,
    /// Share of the time/memory limits a slice may use.
    pub safety_margin: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(300),
            max_per_run: 50,
            release_every: 10,
            fallback_time_limit: Duration::from_secs(55),
            fallback_memory_limit: 128 * 1024 * 1024,
            safety_margin: 0.8,
        }
    }
}

/// What a tick did for one job type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceOutcome {
    Ran { processed: u32, failed: u32 },
    /// Another slice holds the lock.
    Locked,
    NotRunning,
    /// A leftover stop request was applied to a non-running job.
    StopApplied,
    Error(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub outcomes: Vec<(String, SliceOutcome)>,
}

impl TickReport {
    pub fn outcome(&self, job_type: &str) -> Option<&SliceOutcome> {
        self.outcomes
            .iter()
            .find(|(t, _)| t == job_type)
            .map(|(_, outcome)| outcome)
    }

    pub fn processed(&self) -> u32 {
        self.outcomes
            .iter()
            .map(|(_, outcome)| match outcome {
                SliceOutcome::Ran { processed, .. } => *processed,
                _ => 0,
            })
            .sum()
    }
}

fn state_key(job_type: &str) -> String {
    format!("jobs/{}/state", job_type)
}

fn control_key(job_type: &str) -> String {
    format!("jobs/{}/control", job_type)
}

pub struct JobScheduler {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    environment: Arc<dyn ExecutionEnvironment>,
    config: SchedulerConfig,
    handlers: BTreeMap<String, Arc<dyn JobHandler>>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self {
            store,
            clock,
            environment: Arc::new(ProcessEnvironment::default()),
            config,
            handlers: BTreeMap::new(),
            shutdown: None,
        }
    }

    pub fn with_environment(mut self, environment: Arc<dyn ExecutionEnvironment>) -> Self {
        self.environment = environment;
        self
    }

    /// End the current slice early once `shutdown` flips to `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Register the handler for `job_type`, replacing any previous one.
    pub fn register(&mut self, job_type: &str, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.to_string(), handler);
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn now(&self) -> i64 {
        self.clock.epoch_secs()
    }

    fn lock_secs(&self) -> i64 {
        self.config.lock_duration.as_secs() as i64
    }

    fn ensure_registered(&self, job_type: &str) -> Result<(), SchedulerError> {
        if self.handlers.contains_key(job_type) {
            Ok(())
        } else {
            Err(SchedulerError::UnknownJob(job_type.to_string()))
        }
    }

    fn shutting_down(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    async fn load(&self, job_type: &str) -> Result<(JobState, JobControl), SchedulerError> {
        let state = read_document(self.store.as_ref(), &state_key(job_type)).await?;
        let control = read_document(self.store.as_ref(), &control_key(job_type)).await?;
        Ok((state, control))
    }

    async fn update_state<F>(&self, job_type: &str, mutator: F) -> Result<JobState, SchedulerError>
    where
        F: FnMut(&mut JobState) -> bool,
    {
        Ok(update_document(self.store.as_ref(), &state_key(job_type), mutator).await?)
    }

    async fn update_control<F>(
        &self,
        job_type: &str,
        mutator: F,
    ) -> Result<JobControl, SchedulerError>
    where
        F: FnMut(&mut JobControl) -> bool,
    {
        Ok(update_document(self.store.as_ref(), &control_key(job_type), mutator).await?)
    }

    // =========================================================================
    // Control operations
    // =========================================================================

    /// Any state -> running with `total` iterations; counters and flags reset.
    #[instrument(skip(self), level = "debug")]
    pub async fn start(&self, job_type: &str, total: u64) -> Result<JobSnapshot, SchedulerError> {
        self.ensure_registered(job_type)?;
        let now = self.now();

        let state = self
            .update_state(job_type, |s| {
                *s = JobState {
                    status: JobStatus::Running,
                    iterations_total: total,
                    // an in-flight slice keeps its lock
                    lock_until: s.lock_until,
                    ..Default::default()
                };
                true
            })
            .await?;
        let control = self
            .update_control(job_type, |c| {
                *c = JobControl {
                    time: now,
                    ..Default::default()
                };
                true
            })
            .await?;

        info!(job_type, total, "job started");
        Ok(JobSnapshot::new(job_type, &state, &control, now))
    }

    /// Request a pause; the status changes once a slice observes it.
    #[instrument(skip(self), level = "debug")]
    pub async fn pause(&self, job_type: &str) -> Result<(), SchedulerError> {
        self.ensure_registered(job_type)?;
        let now = self.now();
        self.update_control(job_type, |c| {
            c.pause_requested = true;
            c.time = now;
            true
        })
        .await?;
        info!(job_type, "pause requested");
        Ok(())
    }

    /// Request a stop; the status changes once a slice observes it.
    #[instrument(skip(self), level = "debug")]
    pub async fn stop(&self, job_type: &str) -> Result<(), SchedulerError> {
        self.ensure_registered(job_type)?;
        let now = self.now();
        self.update_control(job_type, |c| {
            c.stop_requested = true;
            c.time = now;
            true
        })
        .await?;
        info!(job_type, "stop requested");
        Ok(())
    }

    /// Clear both flags; a paused or stopped job runs again.
    #[instrument(skip(self), level = "debug")]
    pub async fn resume(&self, job_type: &str) -> Result<(), SchedulerError> {
        self.ensure_registered(job_type)?;
        let now = self.now();
        self.update_control(job_type, |c| {
            *c = JobControl {
                time: now,
                ..Default::default()
            };
            true
        })
        .await?;
        self.update_state(job_type, |s| {
            if matches!(s.status, JobStatus::Paused | JobStatus::Stopped) && !s.completed {
                s.status = JobStatus::Running;
                true
            } else {
                false
            }
        })
        .await?;
        info!(job_type, "job resumed");
        Ok(())
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Snapshot of one job type, with staleness recovery.
    ///
    /// A completed or stopped-before-finish run is reported once, then State
    /// and Control are reset to defaults.
    #[instrument(skip(self), level = "debug")]
    pub async fn status(&self, job_type: &str) -> Result<JobSnapshot, SchedulerError> {
        self.ensure_registered(job_type)?;
        let now = self.now();
        let (mut state, mut control) = self.load(job_type).await?;

        if state.status == JobStatus::Running && self.is_stale(&state, &control, now) {
            (state, control) = self.recover_stale(job_type, now).await?;
        }

        let snapshot = JobSnapshot::new(job_type, &state, &control, now);

        if state.awaits_reset() {
            self.reset(job_type).await?;
        }
        Ok(snapshot)
    }

    pub async fn all_statuses(&self) -> Result<Vec<JobSnapshot>, SchedulerError> {
        let mut snapshots = Vec::with_capacity(self.handlers.len());
        for job_type in self.handlers.keys() {
            snapshots.push(self.status(job_type).await?);
        }
        Ok(snapshots)
    }

    /// Read-only snapshot: no staleness recovery, and a finished run stays
    /// pending for the next `status` call.
    pub async fn peek(&self, job_type: &str) -> Result<JobSnapshot, SchedulerError> {
        self.ensure_registered(job_type)?;
        let (state, control) = self.load(job_type).await?;
        Ok(JobSnapshot::new(job_type, &state, &control, self.now()))
    }

    pub async fn peek_all(&self) -> Result<Vec<JobSnapshot>, SchedulerError> {
        let mut snapshots = Vec::with_capacity(self.handlers.len());
        for job_type in self.handlers.keys() {
            snapshots.push(self.peek(job_type).await?);
        }
        Ok(snapshots)
    }

    /// A request nobody acted on for a whole lock duration, with no live lock.
    fn is_stale(&self, state: &JobState, control: &JobControl, now: i64) -> bool {
        control.has_request()
            && now - control.time > self.lock_secs()
            && !state.is_locked(now)
    }

    async fn recover_stale(
        &self,
        job_type: &str,
        now: i64,
    ) -> Result<(JobState, JobControl), SchedulerError> {
        let (_, control) = self.load(job_type).await?;
        let target = if control.stop_requested {
            JobStatus::Stopped
        } else {
            JobStatus::Paused
        };
        warn!(job_type, ?target, "control request went unobserved, forcing transition");

        let state = self
            .update_state(job_type, |s| {
                if s.status == JobStatus::Running && !s.is_locked(now) {
                    s.status = target;
                    true
                } else {
                    false
                }
            })
            .await?;
        let control = self
            .update_control(job_type, |c| {
                *c = JobControl {
                    time: now,
                    ..Default::default()
                };
                true
            })
            .await?;
        Ok((state, control))
    }

    async fn reset(&self, job_type: &str) -> Result<(), SchedulerError> {
        self.update_state(job_type, |s| {
            if s.awaits_reset() && !s.is_locked(self.now()) {
                *s = JobState::default();
                true
            } else {
                false
            }
        })
        .await?;
        self.update_control(job_type, |c| {
            if *c == JobControl::default() {
                false
            } else {
                *c = JobControl::default();
                true
            }
        })
        .await?;
        debug!(job_type, "job state reset after final report");
        Ok(())
    }

    // =========================================================================
    // Tick
    // =========================================================================

    /// One trigger: run a slice for every running, unlocked job type and
    /// settle leftover stop requests on the others.
    #[instrument(skip(self), level = "debug")]
    pub async fn run_all(&self) -> Result<TickReport, SchedulerError> {
        let mut report = TickReport::default();

        for (job_type, handler) in &self.handlers {
            let outcome = match self.tick_job(job_type, handler.as_ref()).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(job_type, error = %e, "slice failed");
                    SliceOutcome::Error(e.to_string())
                }
            };
            report.outcomes.push((job_type.clone(), outcome));
        }
        Ok(report)
    }

    async fn tick_job(
        &self,
        job_type: &str,
        handler: &dyn JobHandler,
    ) -> Result<SliceOutcome, SchedulerError> {
        let now = self.now();
        let (state, control) = self.load(job_type).await?;

        if state.status != JobStatus::Running {
            if control.stop_requested {
                self.update_state(job_type, |s| {
                    if s.status == JobStatus::Running || s.status == JobStatus::Stopped {
                        return false;
                    }
                    s.status = JobStatus::Stopped;
                    true
                })
                .await?;
                self.update_control(job_type, |c| {
                    c.stop_requested = false;
                    c.time = now;
                    true
                })
                .await?;
                info!(job_type, "leftover stop request applied");
                return Ok(SliceOutcome::StopApplied);
            }
            return Ok(SliceOutcome::NotRunning);
        }

        if state.is_locked(now) {
            debug!(job_type, lock_until = state.lock_until, "job locked, skipping");
            return Ok(SliceOutcome::Locked);
        }

        // Compare-and-swap acquisition: the mutator re-checks the fresh
        // document on every retry, so only one contender wins.
        let mut acquired = false;
        let lock_until = now + self.lock_secs();
        self.update_state(job_type, |s| {
            acquired = s.status == JobStatus::Running && !s.is_locked(now);
            if acquired {
                s.lock_until = lock_until;
            }
            acquired
        })
        .await?;
        if !acquired {
            debug!(job_type, "lost lock race, skipping");
            return Ok(SliceOutcome::Locked);
        }

        let slice = self.run_slice(job_type, handler).await;
        let finalized = self.finalize(job_type).await;

        let (processed, failed) = slice?;
        finalized?;
        Ok(SliceOutcome::Ran { processed, failed })
    }

    async fn run_slice(
        &self,
        job_type: &str,
        handler: &dyn JobHandler,
    ) -> Result<(u32, u32), SchedulerError> {
        let budget = SliceBudget::compute(
            self.environment.as_ref(),
            self.config.fallback_time_limit,
            self.config.fallback_memory_limit,
            self.config.safety_margin,
        );
        let started = Instant::now();
        let mut processed = 0u32;
        let mut failed = 0u32;

        while processed < self.config.max_per_run {
            if !budget.allows(started.elapsed(), self.environment.memory_usage()) {
                debug!(job_type, processed, "slice budget exhausted");
                break;
            }
            if self.shutting_down() {
                info!(job_type, processed, "shutdown requested, ending slice");
                break;
            }

            // Fresh reads every iteration so pause/stop land within one item
            let (state, control) = self.load(job_type).await?;
            if control.has_request() || state.status != JobStatus::Running || state.is_finished() {
                break;
            }

            let success = match AssertUnwindSafe(handler.run_iteration(job_type))
                .catch_unwind()
                .await
            {
                Ok(Ok(true)) => true,
                Ok(Ok(false)) => {
                    debug!(job_type, "iteration reported failure");
                    false
                }
                Ok(Err(e)) => {
                    warn!(job_type, error = %e, "iteration failed");
                    false
                }
                Err(_) => {
                    error!(job_type, "iteration panicked");
                    false
                }
            };

            let now = self.now();
            let heartbeat = now + self.lock_secs();
            self.update_state(job_type, |s| {
                s.iterations_done += 1;
                if !success {
                    s.failed_count += 1;
                }
                s.last_run = now;
                s.lock_until = s.lock_until.max(heartbeat);
                true
            })
            .await?;

            processed += 1;
            if !success {
                failed += 1;
            }
            if self.config.release_every > 0 && processed % self.config.release_every == 0 {
                self.environment.release_memory();
            }
        }

        Ok((processed, failed))
    }

    /// Settle the status from the freshest state and release the lock.
    async fn finalize(&self, job_type: &str) -> Result<(), SchedulerError> {
        let now = self.now();
        let (_, control) = self.load(job_type).await?;

        let state = self
            .update_state(job_type, |s| {
                if s.is_finished() {
                    s.completed = true;
                    s.status = JobStatus::Stopped;
                } else if control.stop_requested {
                    s.status = JobStatus::Stopped;
                } else if control.pause_requested {
                    s.status = JobStatus::Paused;
                }
                s.lock_until = 0;
                true
            })
            .await?;
        self.update_control(job_type, |c| {
            c.pause_requested = false;
            c.stop_requested = false;
            c.time = now;
            true
        })
        .await?;

        info!(
            job_type,
            status = ?state.status,
            done = state.iterations_done,
            total = state.iterations_total,
            failed = state.failed_count,
            "slice finished"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offload_core::{ManualClock, MemoryStateStore};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Scripted handler: outcome chosen by call number (1-based).
    struct Scripted<F> {
        calls: AtomicU32,
        outcome: F,
    }

    impl<F> Scripted<F>
    where
        F: Fn(u32) -> anyhow::Result<bool> + Send + Sync,
    {
        fn new(outcome: F) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                outcome,
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<F> JobHandler for Scripted<F>
    where
        F: Fn(u32) -> anyhow::Result<bool> + Send + Sync,
    {
        async fn run_iteration(&self, _job_type: &str) -> anyhow::Result<bool> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.outcome)(call)
        }
    }

    struct Panicking;

    #[async_trait]
    impl JobHandler for Panicking {
        async fn run_iteration(&self, _job_type: &str) -> anyhow::Result<bool> {
            panic!("handler blew up");
        }
    }

    fn one_per_tick() -> SchedulerConfig {
        SchedulerConfig {
            max_per_run: 1,
            ..Default::default()
        }
    }

    fn scheduler(
        config: SchedulerConfig,
        handler: Arc<dyn JobHandler>,
    ) -> (JobScheduler, Arc<ManualClock>, Arc<MemoryStateStore>) {
        let store = Arc::new(MemoryStateStore::new());
        let clock = Arc::new(ManualClock::default());
        let mut scheduler = JobScheduler::new(store.clone(), clock.clone(), config).with_environment(
            Arc::new(ProcessEnvironment::new(
                Some(Duration::from_secs(3600)),
                Some(u64::MAX),
            )),
        );
        scheduler.register("upload", handler);
        (scheduler, clock, store)
    }

    #[tokio::test]
    async fn test_three_ticks_complete_once_then_reset() {
        let handler = Scripted::new(|_| Ok(true));
        let (scheduler, _, _) = scheduler(one_per_tick(), handler.clone());

        scheduler.start("upload", 3).await.unwrap();
        for tick in 1..=3u64 {
            let report = scheduler.run_all().await.unwrap();
            assert_eq!(report.processed(), 1);
            if tick < 3 {
                let snapshot = scheduler.status("upload").await.unwrap();
                assert_eq!(snapshot.done, tick);
                assert_eq!(snapshot.status, JobStatus::Running);
                assert!(!snapshot.locked);
            }
        }
        assert_eq!(handler.calls(), 3);

        let done = scheduler.status("upload").await.unwrap();
        assert!(done.completed);
        assert_eq!(done.percentage, 100);
        assert_eq!(done.label(), "completed");

        // reported exactly once
        let after = scheduler.status("upload").await.unwrap();
        assert!(!after.completed);
        assert_eq!(after.total, 0);
        assert_eq!(after.status, JobStatus::Stopped);

        // nothing left to run
        let report = scheduler.run_all().await.unwrap();
        assert_eq!(report.outcome("upload"), Some(&SliceOutcome::NotRunning));
    }

    #[tokio::test]
    async fn test_peek_leaves_final_report_for_status() {
        let handler = Scripted::new(|_| Ok(true));
        let (scheduler, _, _) = scheduler(SchedulerConfig::default(), handler);

        scheduler.start("upload", 2).await.unwrap();
        scheduler.run_all().await.unwrap();

        for _ in 0..2 {
            let peeked = scheduler.peek_all().await.unwrap();
            assert_eq!(peeked.len(), 1);
            assert!(peeked[0].completed);
        }

        let reported = scheduler.status("upload").await.unwrap();
        assert!(reported.completed);
        assert_eq!(reported.done, 2);

        let after = scheduler.peek("upload").await.unwrap();
        assert!(!after.completed);
        assert_eq!(after.total, 0);
    }

    #[tokio::test]
    async fn test_slice_stops_at_total_within_cap() {
        let handler = Scripted::new(|_| Ok(true));
        let (scheduler, _, _) = scheduler(SchedulerConfig::default(), handler.clone());

        scheduler.start("upload", 4).await.unwrap();
        let report = scheduler.run_all().await.unwrap();
        assert_eq!(
            report.outcome("upload"),
            Some(&SliceOutcome::Ran {
                processed: 4,
                failed: 0
            })
        );
        assert_eq!(handler.calls(), 4);
        assert!(scheduler.status("upload").await.unwrap().completed);
    }

    #[tokio::test]
    async fn test_pause_before_tick_leaves_done_at_zero() {
        let handler = Scripted::new(|_| Ok(true));
        let (scheduler, _, _) = scheduler(one_per_tick(), handler.clone());

        scheduler.start("upload", 5).await.unwrap();
        scheduler.pause("upload").await.unwrap();
        // not observed yet
        assert_eq!(
            scheduler.status("upload").await.unwrap().status,
            JobStatus::Running
        );

        scheduler.run_all().await.unwrap();

        let snapshot = scheduler.status("upload").await.unwrap();
        assert_eq!(snapshot.done, 0);
        assert_eq!(snapshot.status, JobStatus::Paused);
        assert!(!snapshot.pause_requested);
        assert_eq!(handler.calls(), 0);

        // paused jobs are not picked up until resumed
        let report = scheduler.run_all().await.unwrap();
        assert_eq!(report.outcome("upload"), Some(&SliceOutcome::NotRunning));

        scheduler.resume("upload").await.unwrap();
        scheduler.run_all().await.unwrap();
        assert_eq!(scheduler.status("upload").await.unwrap().done, 1);
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_counted() {
        let handler = Scripted::new(|call| match call {
            1 => Ok(false),
            2 => Err(anyhow::anyhow!("upload exploded")),
            _ => Ok(true),
        });
        let (scheduler, _, _) = scheduler(SchedulerConfig::default(), handler);

        scheduler.start("upload", 3).await.unwrap();
        let report = scheduler.run_all().await.unwrap();
        assert_eq!(
            report.outcome("upload"),
            Some(&SliceOutcome::Ran {
                processed: 3,
                failed: 2
            })
        );
        let snapshot = scheduler.status("upload").await.unwrap();
        assert_eq!(snapshot.done, 3);
        assert_eq!(snapshot.failed, 2);
        assert!(snapshot.completed);

        let (panicky, _, _) = self::scheduler(SchedulerConfig::default(), Arc::new(Panicking));
        panicky.start("upload", 2).await.unwrap();
        panicky.run_all().await.unwrap();
        let snapshot = panicky.status("upload").await.unwrap();
        assert_eq!(snapshot.done, 2);
        assert_eq!(snapshot.failed, 2);
    }

    #[tokio::test]
    async fn test_stop_mid_run_reports_once() {
        let handler = Scripted::new(|_| Ok(true));
        let (scheduler, _, _) = scheduler(one_per_tick(), handler);

        scheduler.start("upload", 5).await.unwrap();
        scheduler.run_all().await.unwrap();
        scheduler.stop("upload").await.unwrap();
        scheduler.run_all().await.unwrap();

        let stopped = scheduler.status("upload").await.unwrap();
        assert_eq!(stopped.status, JobStatus::Stopped);
        assert_eq!(stopped.done, 1);
        assert!(!stopped.completed);

        let after = scheduler.status("upload").await.unwrap();
        assert_eq!(after.total, 0);
    }

    #[tokio::test]
    async fn test_leftover_stop_on_paused_job() {
        let handler = Scripted::new(|_| Ok(true));
        let (scheduler, _, _) = scheduler(one_per_tick(), handler);

        scheduler.start("upload", 5).await.unwrap();
        scheduler.pause("upload").await.unwrap();
        scheduler.run_all().await.unwrap();
        scheduler.stop("upload").await.unwrap();

        let report = scheduler.run_all().await.unwrap();
        assert_eq!(report.outcome("upload"), Some(&SliceOutcome::StopApplied));
        let snapshot = scheduler.status("upload").await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Stopped);
        assert!(!snapshot.stop_requested);
    }

    #[tokio::test]
    async fn test_locked_job_is_skipped() {
        let handler = Scripted::new(|_| Ok(true));
        let (scheduler, clock, store) = scheduler(one_per_tick(), handler.clone());
        scheduler.start("upload", 5).await.unwrap();

        // a live slice elsewhere holds the lock
        let now = clock.epoch_secs();
        update_document(store.as_ref(), "jobs/upload/state", |s: &mut JobState| {
            s.lock_until = now + 60;
            true
        })
        .await
        .unwrap();

        let report = scheduler.run_all().await.unwrap();
        assert_eq!(report.outcome("upload"), Some(&SliceOutcome::Locked));
        assert_eq!(handler.calls(), 0);

        // lock expires
        clock.advance(Duration::from_secs(61));
        let report = scheduler.run_all().await.unwrap();
        assert_eq!(report.processed(), 1);
    }

    struct Blocking {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl JobHandler for Blocking {
        async fn run_iteration(&self, _job_type: &str) -> anyhow::Result<bool> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_overlapping_ticks_are_exclusive() {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let handler = Arc::new(Blocking {
            entered: entered.clone(),
            release: release.clone(),
        });
        let (scheduler, _, _) = scheduler(one_per_tick(), handler);
        let scheduler = Arc::new(scheduler);
        scheduler.start("upload", 5).await.unwrap();

        let first = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run_all().await })
        };
        entered.notified().await;

        let second = scheduler.run_all().await.unwrap();
        assert_eq!(second.outcome("upload"), Some(&SliceOutcome::Locked));

        release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.processed(), 1);

        let snapshot = scheduler.status("upload").await.unwrap();
        assert_eq!(snapshot.done, 1);
        assert!(!snapshot.locked);
    }

    #[tokio::test]
    async fn test_stale_request_forces_transition() {
        let handler = Scripted::new(|_| Ok(true));
        let (scheduler, clock, _) = scheduler(one_per_tick(), handler);

        scheduler.start("upload", 5).await.unwrap();
        scheduler.pause("upload").await.unwrap();

        clock.advance(Duration::from_secs(200));
        assert_eq!(
            scheduler.status("upload").await.unwrap().status,
            JobStatus::Running
        );

        scheduler.stop("upload").await.unwrap();
        clock.advance(Duration::from_secs(301));
        let snapshot = scheduler.status("upload").await.unwrap();
        // stop wins over pause
        assert_eq!(snapshot.status, JobStatus::Stopped);
        assert!(!snapshot.pause_requested && !snapshot.stop_requested);
    }

    #[tokio::test]
    async fn test_stale_request_respects_live_lock() {
        let handler = Scripted::new(|_| Ok(true));
        let (scheduler, clock, store) = scheduler(one_per_tick(), handler);

        scheduler.start("upload", 5).await.unwrap();
        scheduler.pause("upload").await.unwrap();
        clock.advance(Duration::from_secs(400));

        // heartbeat from a slow but alive slice
        let now = clock.epoch_secs();
        update_document(store.as_ref(), "jobs/upload/state", |s: &mut JobState| {
            s.lock_until = now + 100;
            true
        })
        .await
        .unwrap();

        let snapshot = scheduler.status("upload").await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Running);
        assert!(snapshot.pause_requested);
    }

    #[tokio::test]
    async fn test_shutdown_ends_slice() {
        let handler = Scripted::new(|_| Ok(true));
        let (tx, rx) = watch::channel(true);
        let (scheduler, _, _) = scheduler(SchedulerConfig::default(), handler.clone());
        let scheduler = scheduler.with_shutdown(rx);

        scheduler.start("upload", 5).await.unwrap();
        let report = scheduler.run_all().await.unwrap();
        assert_eq!(report.processed(), 0);
        assert_eq!(handler.calls(), 0);
        drop(tx);

        // lock was released, job still running
        let snapshot = scheduler.status("upload").await.unwrap();
        assert_eq!(snapshot.status, JobStatus::Running);
        assert!(!snapshot.locked);
    }

    #[tokio::test]
    async fn test_unknown_job_type() {
        let handler = Scripted::new(|_| Ok(true));
        let (scheduler, _, _) = scheduler(one_per_tick(), handler);
        let err = tokio_test::assert_err!(scheduler.start("thumbnails", 1).await);
        assert!(matches!(err, SchedulerError::UnknownJob(_)));
    }
}
