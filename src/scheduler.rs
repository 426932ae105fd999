//! Drives batch generation.
//!
//! A single loop owns all scheduling state: the armed timer (normal schedule
//! or retry, never both) and the active run. Every trigger supersedes the
//! active run, so two batches never overlap and the output tree has exactly
//! one writer at a time.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AppError, Result};
use crate::generator::BatchSummary;
use crate::schedule::SchedulePolicy;

/// One full generation pass, cancellable through `cancel`.
#[async_trait]
pub trait BatchRunner: Send + Sync {
    async fn run_batch(&self, cancel: CancellationToken) -> Result<BatchSummary>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Retry,
    Startup,
    Manual,
}

#[derive(Debug)]
pub enum RunOutcome {
    Succeeded(BatchSummary),
    Failed(AppError),
    Superseded,
}

impl From<Result<BatchSummary>> for RunOutcome {
    fn from(result: Result<BatchSummary>) -> Self {
        match result {
            Ok(summary) => RunOutcome::Succeeded(summary),
            Err(AppError::Cancelled) => RunOutcome::Superseded,
            Err(e) => RunOutcome::Failed(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Succeeded,
    Failed,
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArmedTimer {
    pub trigger: Trigger,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveRunStatus {
    pub run: u64,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LastRun {
    pub run: u64,
    pub trigger: Trigger,
    pub finished_at: DateTime<Utc>,
    pub outcome: OutcomeKind,
    pub error: Option<String>,
}

/// Snapshot published after every scheduler state change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub policy: String,
    pub active_run: Option<ActiveRunStatus>,
    pub armed: Option<ArmedTimer>,
    pub runs_started: u64,
    pub consecutive_failures: u32,
    pub last_run: Option<LastRun>,
}

enum Command {
    Trigger,
}

struct RunReport {
    run: u64,
    outcome: RunOutcome,
}

struct Armed {
    trigger: Trigger,
    deadline: Instant,
    at: DateTime<Utc>,
}

struct ActiveRun {
    run: u64,
    trigger: Trigger,
    started_at: DateTime<Utc>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Cloneable access to a running [`Scheduler`].
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SchedulerStatus>,
}

impl SchedulerHandle {
    /// Requests an immediate run. Returns `false` once the scheduler is gone.
    pub fn trigger(&self) -> bool {
        self.commands.send(Command::Trigger).is_ok()
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }
}

pub struct Scheduler {
    policy: SchedulePolicy,
    runner: Arc<dyn BatchRunner>,
    commands: mpsc::UnboundedReceiver<Command>,
    reports_tx: mpsc::UnboundedSender<RunReport>,
    reports: mpsc::UnboundedReceiver<RunReport>,
    status: watch::Sender<SchedulerStatus>,
    armed: Option<Armed>,
    active: Option<ActiveRun>,
    runs_started: u64,
    consecutive_failures: u32,
    last_run: Option<LastRun>,
}

impl Scheduler {
    pub fn new(policy: SchedulePolicy, runner: Arc<dyn BatchRunner>) -> (Self, SchedulerHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (reports_tx, reports) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(SchedulerStatus {
            policy: policy.describe(),
            ..Default::default()
        });

        let scheduler = Self {
            policy,
            runner,
            commands,
            reports_tx,
            reports,
            status,
            armed: None,
            active: None,
            runs_started: 0,
            consecutive_failures: 0,
            last_run: None,
        };
        let handle = SchedulerHandle {
            commands: commands_tx,
            status: status_rx,
        };
        (scheduler, handle)
    }

    /// Runs until `shutdown` fires, then clears the armed timer and cancels
    /// the active run.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(policy = %self.policy.describe(), "scheduler started");

        self.arm_normal_schedule();
        if self.policy.run_on_startup() {
            self.start_run(Trigger::Startup).await;
        }
        self.publish();

        loop {
            let deadline = self.armed.as_ref().map(|armed| armed.deadline);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wait_until(deadline) => self.fire_timer().await,
                Some(command) = self.commands.recv() => match command {
                    Command::Trigger => self.start_run(Trigger::Manual).await,
                },
                Some(report) = self.reports.recv() => self.finish_run(report),
            }
            self.publish();
        }

        self.armed = None;
        if let Some(active) = self.active.take() {
            info!(run = active.run, "cancelling active run for shutdown");
            active.cancel.cancel();
            if let Err(e) = active.handle.await {
                warn!(run = active.run, "run task ended abnormally: {e}");
            }
        }
        self.publish();
        info!("scheduler stopped");
    }

    fn arm_normal_schedule(&mut self) {
        let now = Local::now();
        let delay = match self.policy.next_run(&now) {
            Some(next) => (next - now).to_std().unwrap_or(Duration::ZERO),
            None => Duration::MAX,
        };
        self.arm(Trigger::Scheduled, deadline_after(Instant::now(), delay));
    }

    fn arm(&mut self, trigger: Trigger, deadline: Instant) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let at = chrono::Duration::from_std(remaining)
            .ok()
            .and_then(|remaining| Utc::now().checked_add_signed(remaining))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        info!(?trigger, %at, "next run armed");
        self.armed = Some(Armed { trigger, deadline, at });
    }

    async fn fire_timer(&mut self) {
        let Some(armed) = self.armed.take() else {
            return;
        };
        // The interval cadence is measured from deadlines, not from run completion.
        if let SchedulePolicy::FixedInterval { period, .. } = &self.policy {
            let next = deadline_after(armed.deadline, *period);
            self.arm(Trigger::Scheduled, next);
        }
        self.start_run(armed.trigger).await;
    }

    async fn start_run(&mut self, trigger: Trigger) {
        if let Some(previous) = self.active.take() {
            info!(run = previous.run, ?trigger, "superseding active run");
            previous.cancel.cancel();
            if let Err(e) = previous.handle.await {
                warn!(run = previous.run, "superseded run ended abnormally: {e}");
            }
        }

        self.runs_started += 1;
        let run = self.runs_started;
        let cancel = CancellationToken::new();
        let runner = self.runner.clone();
        let reports = self.reports_tx.clone();
        let token = cancel.clone();

        info!(run, ?trigger, "starting batch run");
        let handle = tokio::spawn(async move {
            // Panics are reported as failed runs.
            let outcome = match AssertUnwindSafe(runner.run_batch(token)).catch_unwind().await {
                Ok(result) => RunOutcome::from(result),
                Err(panic) => RunOutcome::Failed(AppError::InternalError(format!(
                    "batch run panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };
            let _ = reports.send(RunReport { run, outcome });
        });

        self.active = Some(ActiveRun {
            run,
            trigger,
            started_at: Utc::now(),
            cancel,
            handle,
        });
    }

    fn finish_run(&mut self, report: RunReport) {
        let trigger = match &self.active {
            Some(active) if active.run == report.run => active.trigger,
            _ => {
                debug!(run = report.run, "ignoring report from a superseded run");
                return;
            }
        };
        self.active = None;

        let (kind, error) = match report.outcome {
            RunOutcome::Succeeded(summary) => {
                self.consecutive_failures = 0;
                info!(run = report.run, articles = summary.articles, "batch run succeeded");
                if let SchedulePolicy::DailyAtHour { .. } = self.policy {
                    // Replaces any pending retry.
                    self.arm_normal_schedule();
                }
                (OutcomeKind::Succeeded, None)
            }
            RunOutcome::Failed(err) => {
                self.consecutive_failures += 1;
                error!(
                    run = report.run,
                    failures = self.consecutive_failures,
                    "batch run failed: {err}"
                );
                if let SchedulePolicy::DailyAtHour { retry_delay, .. } = self.policy {
                    self.arm(Trigger::Retry, deadline_after(Instant::now(), retry_delay));
                }
                (OutcomeKind::Failed, Some(err.to_string()))
            }
            RunOutcome::Superseded => {
                debug!(run = report.run, "batch run was cancelled");
                (OutcomeKind::Superseded, None)
            }
        };

        self.last_run = Some(LastRun {
            run: report.run,
            trigger,
            finished_at: Utc::now(),
            outcome: kind,
            error,
        });
    }

    fn publish(&self) {
        let snapshot = SchedulerStatus {
            policy: self.policy.describe(),
            active_run: self.active.as_ref().map(|active| ActiveRunStatus {
                run: active.run,
                trigger: active.trigger,
                started_at: active.started_at,
            }),
            armed: self.armed.as_ref().map(|armed| ArmedTimer {
                trigger: armed.trigger,
                at: armed.at,
            }),
            runs_started: self.runs_started,
            consecutive_failures: self.consecutive_failures,
            last_run: self.last_run.clone(),
        };
        self.status.send_replace(snapshot);
    }
}

// Far enough to never fire; tokio clamps longer sleeps anyway.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn deadline_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        *message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
