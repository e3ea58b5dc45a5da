//! Task scheduler - runs a dependency graph of tasks with bounded concurrency.
//!
//! Tasks become eligible the moment every dependency reaches a terminal
//! state. Outcomes flow downstream without running the dependent:
//! - a `Failed` dependency fails its dependents (transitively)
//! - a `NotReady` or `Blocked` dependency blocks its dependents
//!
//! A scheduler is built for one pass and runs at most once.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use futures::future::BoxFuture;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::cancel::CancelToken;

/// Handle to a task inside the [`Scheduler`] that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(usize);

/// What a task function reports when it completes without error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Work done, dependents may proceed.
    Ready,
    /// Work done but the result is not usable yet. Dependents stay blocked
    /// for this run; this is not a failure.
    NotReady(String),
}

/// Lifecycle of a task within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    /// Ran, but reported [`TaskOutcome::NotReady`].
    NotReady,
    /// Never ran because a dependency was not ready.
    Blocked,
    /// Returned an error, panicked, or had a failed dependency.
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskState::Pending | TaskState::Running)
    }
}

/// Boxed task body.
pub type TaskFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<TaskOutcome>> + Send>;

/// Errors returned by [`Scheduler::run`].
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The dependency graph contains a cycle through this task.
    #[error("task '{task}' has a circular dependency")]
    Cycle { task: String },

    /// First task that failed on its own (not by propagation).
    #[error("task '{task}' failed: {source:#}")]
    TaskFailed {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    /// The run was cancelled before every task could start.
    #[error("scheduler run was cancelled")]
    Cancelled,

    /// `run` was called a second time.
    #[error("scheduler has already run")]
    AlreadyRun,
}

/// Summary of a run that finished without failures.
#[derive(Debug, Default, Clone)]
pub struct RunReport {
    pub succeeded: Vec<String>,
    /// `(task label, reason)` for tasks that reported not ready.
    pub not_ready: Vec<(String, String)>,
    pub blocked: Vec<String>,
}

impl RunReport {
    /// Every task ran and reported ready.
    pub fn is_complete(&self) -> bool {
        self.not_ready.is_empty() && self.blocked.is_empty()
    }
}

struct Task {
    label: String,
    func: Option<TaskFn>,
    dependencies: Vec<TaskId>,
    state: TaskState,
    detail: Option<String>,
}

/// Concurrent task scheduler.
pub struct Scheduler {
    concurrency: usize,
    tasks: Vec<Task>,
    has_run: bool,
}

impl Scheduler {
    /// Create a scheduler running at most `concurrency` tasks at once.
    /// A width of zero is treated as one.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            tasks: Vec::new(),
            has_run: false,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Register a task function and return its handle.
    pub fn add_task<F, Fut>(&mut self, label: impl Into<String>, func: F) -> TaskId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<TaskOutcome>> + Send + 'static,
    {
        let id = TaskId(self.tasks.len());
        self.tasks.push(Task {
            label: label.into(),
            func: Some(Box::new(move || func().boxed())),
            dependencies: Vec::new(),
            state: TaskState::Pending,
            detail: None,
        });
        id
    }

    /// Make `task` wait for `dependency`. Returns `false` if the edge
    /// already existed.
    ///
    /// Panics if either handle belongs to another scheduler.
    pub fn depends_on(&mut self, task: TaskId, dependency: TaskId) -> bool {
        assert!(dependency.0 < self.tasks.len(), "unknown dependency task");
        let deps = &mut self.tasks[task.0].dependencies;
        if deps.contains(&dependency) {
            return false;
        }
        deps.push(dependency);
        true
    }

    /// Drop the edge `task -> dependency`. Returns `false` if it did not exist.
    pub fn remove_dependency(&mut self, task: TaskId, dependency: TaskId) -> bool {
        let deps = &mut self.tasks[task.0].dependencies;
        let before = deps.len();
        deps.retain(|d| *d != dependency);
        deps.len() != before
    }

    pub fn dependencies(&self, task: TaskId) -> &[TaskId] {
        &self.tasks[task.0].dependencies
    }

    pub fn state(&self, task: TaskId) -> TaskState {
        self.tasks[task.0].state
    }

    pub fn label(&self, task: TaskId) -> &str {
        &self.tasks[task.0].label
    }

    /// Fail if the dependency graph has a cycle (self-dependencies included).
    pub fn check_acyclic(&self) -> Result<(), SchedulerError> {
        let edge_count = self.tasks.iter().map(|t| t.dependencies.len()).sum();
        let mut graph = DiGraph::<usize, ()>::with_capacity(self.tasks.len(), edge_count);
        let nodes: Vec<_> = (0..self.tasks.len()).map(|i| graph.add_node(i)).collect();
        for (idx, task) in self.tasks.iter().enumerate() {
            for dep in &task.dependencies {
                graph.add_edge(nodes[dep.0], nodes[idx], ());
            }
        }

        toposort(&graph, None)
            .map(|_| ())
            .map_err(|cycle| SchedulerError::Cycle {
                task: self.tasks[graph[cycle.node_id()]].label.clone(),
            })
    }

    /// Run every task to a terminal state.
    ///
    /// Independent tasks keep running after a failure; the first failure is
    /// returned once nothing else can make progress. On cancellation no new
    /// task starts, running tasks finish, and unstarted tasks stay `Pending`.
    pub async fn run(&mut self, cancel: &CancelToken) -> Result<RunReport, SchedulerError> {
        if self.has_run {
            return Err(SchedulerError::AlreadyRun);
        }
        self.check_acyclic()?;
        self.has_run = true;

        let count = self.tasks.len();
        let mut dependents: Vec<Vec<TaskId>> = vec![Vec::new(); count];
        let mut remaining: Vec<usize> = Vec::with_capacity(count);
        for (idx, task) in self.tasks.iter().enumerate() {
            remaining.push(task.dependencies.len());
            for dep in &task.dependencies {
                dependents[dep.0].push(TaskId(idx));
            }
        }

        let mut ready: VecDeque<TaskId> = (0..count)
            .filter(|&idx| remaining[idx] == 0)
            .map(TaskId)
            .collect();
        let mut in_flight: JoinSet<(TaskId, anyhow::Result<TaskOutcome>)> = JoinSet::new();
        let mut first_failure: Option<(String, anyhow::Error)> = None;
        let mut cancelled = cancel.is_cancelled();

        loop {
            while !cancelled && in_flight.len() < self.concurrency {
                let Some(id) = ready.pop_front() else { break };
                if let Err(e) = self.start(id, &mut in_flight) {
                    self.fail(id, e, &mut first_failure);
                    self.settle(id, &dependents, &mut remaining, &mut ready);
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    let Some(joined) = joined else { continue };
                    let (id, result) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            // Panics are caught inside the task, so this is
                            // a runtime shutdown.
                            error!("Scheduler lost a running task: {}", e);
                            return Err(SchedulerError::Cancelled);
                        }
                    };

                    let task = &mut self.tasks[id.0];
                    match result {
                        Ok(TaskOutcome::Ready) => {
                            debug!(task = %task.label, "Task succeeded");
                            task.state = TaskState::Succeeded;
                        }
                        Ok(TaskOutcome::NotReady(reason)) => {
                            debug!(task = %task.label, %reason, "Task not ready");
                            task.state = TaskState::NotReady;
                            task.detail = Some(reason);
                        }
                        Err(e) => self.fail(id, e, &mut first_failure),
                    }

                    self.settle(id, &dependents, &mut remaining, &mut ready);
                }
                _ = cancel.cancelled(), if !cancelled => {
                    warn!(running = in_flight.len(), "Cancellation requested, draining running tasks");
                    cancelled = true;
                }
            }
        }

        if cancelled && self.tasks.iter().any(|t| t.state == TaskState::Pending) {
            return Err(SchedulerError::Cancelled);
        }

        if let Some((task, source)) = first_failure {
            return Err(SchedulerError::TaskFailed { task, source });
        }

        let mut report = RunReport::default();
        for task in &self.tasks {
            match task.state {
                TaskState::Succeeded => report.succeeded.push(task.label.clone()),
                TaskState::NotReady => report.not_ready.push((
                    task.label.clone(),
                    task.detail.clone().unwrap_or_default(),
                )),
                TaskState::Blocked => report.blocked.push(task.label.clone()),
                _ => {}
            }
        }
        Ok(report)
    }

    fn start(
        &mut self,
        id: TaskId,
        in_flight: &mut JoinSet<(TaskId, anyhow::Result<TaskOutcome>)>,
    ) -> anyhow::Result<()> {
        let task = &mut self.tasks[id.0];
        let Some(func) = task.func.take() else {
            anyhow::bail!("task function already consumed");
        };

        debug!(task = %task.label, "Starting task");
        task.state = TaskState::Running;
        in_flight.spawn(async move {
            let result = match AssertUnwindSafe(async move { func().await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("task panicked")),
            };
            (id, result)
        });
        Ok(())
    }

    fn fail(
        &mut self,
        id: TaskId,
        error: anyhow::Error,
        first_failure: &mut Option<(String, anyhow::Error)>,
    ) {
        let task = &mut self.tasks[id.0];
        error!(task = %task.label, "Task failed: {:#}", error);
        task.state = TaskState::Failed;
        task.detail = Some(format!("{:#}", error));
        if first_failure.is_none() {
            *first_failure = Some((task.label.clone(), error));
        }
    }

    /// Release the dependents of a task that just reached a terminal state.
    /// Dependents that cannot run are settled in place and released in turn.
    fn settle(
        &mut self,
        id: TaskId,
        dependents: &[Vec<TaskId>],
        remaining: &mut [usize],
        ready: &mut VecDeque<TaskId>,
    ) {
        let mut settled = vec![id];
        while let Some(done) = settled.pop() {
            for &child in &dependents[done.0] {
                remaining[child.0] -= 1;
                if remaining[child.0] > 0 {
                    continue;
                }

                let dep_states = self.tasks[child.0]
                    .dependencies
                    .iter()
                    .map(|d| self.tasks[d.0].state);
                let mut failed = false;
                let mut blocked = false;
                for state in dep_states {
                    match state {
                        TaskState::Failed => failed = true,
                        TaskState::NotReady | TaskState::Blocked => blocked = true,
                        _ => {}
                    }
                }

                let task = &mut self.tasks[child.0];
                if failed {
                    debug!(task = %task.label, "Dependency failed, not running task");
                    task.state = TaskState::Failed;
                    task.detail = Some("dependency failed".to_string());
                    settled.push(child);
                } else if blocked {
                    debug!(task = %task.label, "Dependency not ready, blocking task");
                    task.state = TaskState::Blocked;
                    settled.push(child);
                } else {
                    ready.push_back(child);
                }
            }
        }
    }
}
