//! Task registry: per-task progress state plus a broadcast channel.
//!
//! Every task entry pairs a mutex-guarded state with a bounded
//! `tokio::sync::broadcast` sender. Writes and sends happen under the same
//! lock, and subscribers take their snapshot and receiver under that lock
//! too, so a subscriber can neither miss an update nor see a torn
//! (percentage, message) pair.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use oncall_shared::{
    OncallError, ProgressEvent, RegistryConfig, Result, Stage, TaskId, TaskOutcome, TaskResult,
};

use crate::subscription::Subscription;

// ---------------------------------------------------------------------------
// Task entry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TaskState {
    stage: Stage,
    message: String,
    percentage: u8,
    completed: bool,
    outcome: Option<TaskOutcome>,
    created_at: Instant,
    completed_at: Option<Instant>,
}

impl TaskState {
    fn event(&self) -> ProgressEvent {
        ProgressEvent {
            stage: self.stage,
            message: self.message.clone(),
            percentage: self.percentage,
            completed: self.completed,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TaskEntry {
    state: Mutex<TaskState>,
    tx: broadcast::Sender<ProgressEvent>,
}

impl TaskEntry {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(TaskState {
                stage: Stage::Created,
                message: "Task created".into(),
                percentage: 0,
                completed: false,
                outcome: None,
                created_at: Instant::now(),
                completed_at: None,
            }),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TaskState> {
        // No invariant spans a panic inside the critical section.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state as an event.
    pub(crate) fn snapshot(&self) -> ProgressEvent {
        self.lock().event()
    }

    /// Snapshot and receiver taken atomically with respect to writers.
    pub(crate) fn attach(&self) -> (ProgressEvent, broadcast::Receiver<ProgressEvent>) {
        let state = self.lock();
        (state.event(), self.tx.subscribe())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// In-memory registry of analysis tasks.
///
/// Created once at process start and shared (`Arc`) between the pipeline
/// runner, which is the only writer of a given task, and any number of
/// subscribers.
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<TaskId, Arc<TaskEntry>>>,
    config: RegistryConfig,
}

impl TaskRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<TaskId, Arc<TaskEntry>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry(&self, task_id: TaskId) -> Result<Arc<TaskEntry>> {
        self.tasks()
            .get(&task_id)
            .cloned()
            .ok_or(OncallError::TaskNotFound(task_id))
    }

    /// Allocate a fresh task in the `CREATED` state.
    pub fn create_task(&self) -> TaskId {
        let task_id = TaskId::new();
        let entry = Arc::new(TaskEntry::new(self.config.channel_capacity));
        self.tasks().insert(task_id, entry);
        debug!(%task_id, "task created");
        task_id
    }

    /// Record progress and notify subscribers.
    ///
    /// The stored percentage is clamped to 100 and never moves backwards; a
    /// lower value keeps the previous percentage but still updates the
    /// message. Stages may only move forward.
    pub fn publish(
        &self,
        task_id: TaskId,
        stage: Stage,
        message: impl Into<String>,
        percentage: u8,
    ) -> Result<()> {
        let entry = self.entry(task_id)?;
        let mut state = entry.lock();

        if state.completed {
            return Err(OncallError::TaskAlreadyCompleted(task_id));
        }
        if stage.is_terminal() {
            return Err(OncallError::validation(format!(
                "stage {stage} is terminal; use complete()"
            )));
        }
        if stage < state.stage {
            return Err(OncallError::validation(format!(
                "stage {stage} cannot follow {}",
                state.stage
            )));
        }

        state.stage = stage;
        state.message = message.into();
        state.percentage = percentage.min(100).max(state.percentage);

        // No receivers is fine; late subscribers start from the snapshot.
        let _ = entry.tx.send(state.event());
        Ok(())
    }

    /// Mark the task terminal and store its outcome.
    ///
    /// Success moves the task to `DONE` at 100%; failure moves it to `FAILED`
    /// and keeps the last percentage. Every current subscriber receives the
    /// terminal event, and later subscribers get it immediately.
    #[instrument(skip_all, fields(%task_id))]
    pub fn complete(&self, task_id: TaskId, outcome: TaskOutcome) -> Result<()> {
        let entry = self.entry(task_id)?;
        let mut state = entry.lock();

        if state.completed {
            return Err(OncallError::TaskAlreadyCompleted(task_id));
        }

        match &outcome {
            Ok(_) => {
                state.stage = Stage::Done;
                state.message = "Analysis complete".into();
                state.percentage = 100;
            }
            Err(failure) => {
                state.stage = Stage::Failed;
                state.message = failure.to_string();
            }
        }
        state.completed = true;
        state.completed_at = Some(Instant::now());
        state.outcome = Some(outcome);

        let _ = entry.tx.send(state.event());
        info!(stage = %state.stage, "task completed");
        Ok(())
    }

    /// Current progress of a task.
    pub fn snapshot(&self, task_id: TaskId) -> Result<ProgressEvent> {
        Ok(self.entry(task_id)?.snapshot())
    }

    /// Follow a task's progress from its current state onward.
    pub fn subscribe(&self, task_id: TaskId) -> Result<Subscription> {
        let entry = self.entry(task_id)?;
        Ok(Subscription::new(
            task_id,
            entry,
            self.config.stall_timeout(),
        ))
    }

    /// The task's outcome, or `Pending` while it is still running.
    pub fn get_result(&self, task_id: TaskId) -> Result<TaskResult> {
        let entry = self.entry(task_id)?;
        let state = entry.lock();
        Ok(match &state.outcome {
            None => TaskResult::Pending,
            Some(Ok(report)) => TaskResult::Completed {
                report: report.clone(),
            },
            Some(Err(failure)) => TaskResult::Failed {
                error: failure.clone(),
            },
        })
    }

    /// Remove a completed task. Running tasks cannot be evicted.
    pub fn evict(&self, task_id: TaskId) -> Result<()> {
        let mut tasks = self.tasks();
        let entry = tasks
            .get(&task_id)
            .ok_or(OncallError::TaskNotFound(task_id))?;
        if !entry.lock().completed {
            return Err(OncallError::validation(format!(
                "task {task_id} is still running"
            )));
        }
        tasks.remove(&task_id);
        debug!(%task_id, "task evicted");
        Ok(())
    }

    /// Drop completed tasks whose completion is older than the TTL.
    /// Returns the number of tasks removed.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_older_than(self.config.ttl())
    }

    fn sweep_older_than(&self, ttl: Duration) -> usize {
        let mut tasks = self.tasks();
        let before = tasks.len();
        tasks.retain(|_, entry| {
            let state = entry.lock();
            match state.completed_at {
                Some(at) => at.elapsed() < ttl,
                None => true,
            }
        });
        before - tasks.len()
    }

    /// Periodically sweep expired tasks until the registry is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = self.config.sweep_interval().max(Duration::from_secs(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let removed = registry.sweep_expired();
                if removed > 0 {
                    info!(removed, remaining = registry.len(), "swept expired tasks");
                }
            }
        })
    }

    /// Number of tracked tasks.
    pub fn len(&self) -> usize {
        self.tasks().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks().is_empty()
    }

    /// Age of a task since creation.
    pub fn age(&self, task_id: TaskId) -> Result<Duration> {
        Ok(self.entry(task_id)?.lock().created_at.elapsed())
    }
}
