//! Concurrent fan-out with per-task failure criticality
//!
//! Every task of a fan-out starts immediately on its own Tokio task. Joining
//! always waits for all of them; there is no early return. The first
//! [`Criticality::Fatal`] failure in completion order becomes the outcome,
//! while [`Criticality::BestEffort`] failures are only logged.
//!
//! Tasks must not depend on each other's side effects: they run in no
//! particular order.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info_span, warn};

use crate::context::RequestContext;
use crate::error::{BoxError, RecordError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Criticality {
    /// Failure fails the whole operation
    Fatal,
    /// Failure is logged and otherwise ignored
    BestEffort,
}

/// One unit of work in a fan-out
pub struct Task {
    name: String,
    criticality: Criticality,
    work: BoxFuture<'static, Result<(), BoxError>>,
}

impl Task {
    pub fn new<F>(name: impl Into<String>, criticality: Criticality, work: F) -> Self
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            criticality,
            work: Box::pin(work),
        }
    }

    pub fn fatal<F>(name: impl Into<String>, work: F) -> Self
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self::new(name, Criticality::Fatal, work)
    }

    pub fn best_effort<F>(name: impl Into<String>, work: F) -> Self
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        Self::new(name, Criticality::BestEffort, work)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn criticality(&self) -> Criticality {
        self.criticality
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("criticality", &self.criticality)
            .finish_non_exhaustive()
    }
}

/// How one task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub name: String,
    pub criticality: Criticality,
    /// `None` on success
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// The fatal failure that decided a fan-out
#[derive(Debug)]
pub struct TaskFailure {
    pub task: String,
    pub source: BoxError,
}

/// Result of joining a fan-out
#[derive(Debug, Default)]
pub struct FanOutReport {
    /// Per-task outcomes, in completion order
    pub outcomes: Vec<TaskOutcome>,
    /// First fatal failure by completion order
    pub fatal: Option<TaskFailure>,
    pub best_effort_failures: usize,
}

impl FanOutReport {
    pub fn succeeded(&self) -> bool {
        self.fatal.is_none()
    }

    /// Surface the deciding failure as `DownstreamCallFailed` for `key`
    pub fn into_result(self, key: impl Into<String>) -> Result<(), RecordError> {
        match self.fatal {
            None => Ok(()),
            Some(TaskFailure { task, source }) => Err(RecordError::DownstreamCallFailed {
                key: key.into(),
                task,
                source,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FanOutCoordinator;

impl FanOutCoordinator {
    pub fn new() -> Self {
        Self
    }

    /// Start every task now; the returned handle must be joined to observe the outcome.
    /// Dropping it instead aborts whatever is still running.
    pub fn launch(&self, ctx: &RequestContext, tasks: Vec<Task>) -> FanOut {
        let mut set = JoinSet::new();
        let mut meta = Vec::with_capacity(tasks.len());

        for (index, task) in tasks.into_iter().enumerate() {
            let span = info_span!("fan_out_task", task = %task.name, req_id = ctx.req_id);
            meta.push((task.name, task.criticality));

            let work = AssertUnwindSafe(task.work).catch_unwind().map(move |caught| {
                let result = caught.unwrap_or_else(|panic| Err(panic_message(panic).into()));
                (index, result)
            });
            set.spawn(work.instrument(span));
        }

        FanOut { set, meta }
    }

    /// Launch and join
    pub async fn run(&self, ctx: &RequestContext, tasks: Vec<Task>) -> FanOutReport {
        self.launch(ctx, tasks).join().await
    }
}

/// Tasks of one fan-out, in flight
pub struct FanOut {
    set: JoinSet<(usize, Result<(), BoxError>)>,
    meta: Vec<(String, Criticality)>,
}

impl FanOut {
    pub fn len(&self) -> usize {
        self.meta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }

    /// Wait for every task to finish and aggregate their outcomes
    pub async fn join(mut self) -> FanOutReport {
        let mut report = FanOutReport::default();
        let mut finished = vec![false; self.meta.len()];

        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok((index, result)) => {
                    finished[index] = true;
                    let (name, criticality) = self.meta[index].clone();
                    record(&mut report, name, criticality, result);
                }
                Err(e) => {
                    // Panics are caught inside the task, so only cancellation lands here.
                    error!("Fan-out task could not be joined: {}", e);
                }
            }
        }

        for (index, done) in finished.into_iter().enumerate() {
            if !done {
                let (name, criticality) = self.meta[index].clone();
                record(&mut report, name, criticality, Err("task was cancelled".into()));
            }
        }

        report
    }
}

fn record(
    report: &mut FanOutReport,
    name: String,
    criticality: Criticality,
    result: Result<(), BoxError>,
) {
    match result {
        Ok(()) => {
            debug!("Fan-out task {} completed", name);
            report.outcomes.push(TaskOutcome {
                name,
                criticality,
                error: None,
            });
        }
        Err(e) => {
            match criticality {
                Criticality::Fatal => error!("Fatal fan-out task {} failed: {}", name, e),
                Criticality::BestEffort => {
                    warn!("Best-effort fan-out task {} failed: {}", name, e);
                    report.best_effort_failures += 1;
                }
            }
            report.outcomes.push(TaskOutcome {
                name: name.clone(),
                criticality,
                error: Some(e.to_string()),
            });
            if criticality == Criticality::Fatal && report.fatal.is_none() {
                report.fatal = Some(TaskFailure {
                    task: name,
                    source: e,
                });
            }
        }
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("task panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("task panicked: {msg}")
    } else {
        "task panicked".to_owned()
    }
}
