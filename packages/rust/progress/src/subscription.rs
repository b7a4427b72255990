//! Subscriber side of the progress bus.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use oncall_shared::{OncallError, ProgressEvent, Result, TaskId};

use crate::registry::TaskEntry;

/// A lazy sequence of progress events for one task.
///
/// Yields the snapshot taken at subscribe time first, then every later
/// update, and ends after the `completed = true` event. If no update
/// arrives within the inactivity window the subscription yields
/// [`OncallError::StalledTask`] once and ends. Dropping a subscription
/// has no effect on the task.
pub struct Subscription {
    task_id: TaskId,
    entry: Arc<TaskEntry>,
    rx: broadcast::Receiver<ProgressEvent>,
    pending: Option<ProgressEvent>,
    stall_timeout: Duration,
    last_percentage: u8,
    finished: bool,
}

impl Subscription {
    pub(crate) fn new(task_id: TaskId, entry: Arc<TaskEntry>, stall_timeout: Duration) -> Self {
        let (snapshot, rx) = entry.attach();
        Self {
            task_id,
            entry,
            rx,
            pending: Some(snapshot),
            stall_timeout,
            last_percentage: 0,
            finished: false,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Wait for the next event. Returns `None` once the stream has ended.
    pub async fn next_event(&mut self) -> Option<Result<ProgressEvent>> {
        if self.finished {
            return None;
        }
        if let Some(event) = self.pending.take() {
            return Some(Ok(self.emit(event)));
        }

        loop {
            match tokio::time::timeout(self.stall_timeout, self.rx.recv()).await {
                Err(_) => {
                    self.finished = true;
                    return Some(Err(OncallError::StalledTask {
                        task_id: self.task_id,
                        idle: self.stall_timeout,
                    }));
                }
                Ok(Ok(event)) => {
                    // Buffered events older than a resync snapshot are stale.
                    if !event.completed && event.percentage < self.last_percentage {
                        continue;
                    }
                    return Some(Ok(self.emit(event)));
                }
                Ok(Err(RecvError::Lagged(skipped))) => {
                    warn!(task_id = %self.task_id, skipped, "subscriber lagged, resyncing from snapshot");
                    let snapshot = self.entry.snapshot();
                    return Some(Ok(self.emit(snapshot)));
                }
                Ok(Err(RecvError::Closed)) => {
                    debug!(task_id = %self.task_id, "progress channel closed");
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    fn emit(&mut self, event: ProgressEvent) -> ProgressEvent {
        self.last_percentage = self.last_percentage.max(event.percentage);
        if event.completed {
            self.finished = true;
        }
        event
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<ProgressEvent>> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            sub.next_event().await.map(|item| (item, sub))
        })
    }
}
