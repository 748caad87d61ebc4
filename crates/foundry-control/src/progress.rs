//! Phase-progress fan-out.
//!
//! Events go to whoever is subscribed when they are emitted. The only
//! history kept is the latest event per task, which a new subscriber sees
//! first. Emitting never waits for subscribers: a subscriber that falls
//! behind the channel capacity skips ahead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::types::{Phase, TaskId};

/// One progress update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    /// Task the update belongs to.
    pub task_id: TaskId,
    /// Emission order across the reporter.
    pub seq: u64,
    /// Phase the task entered.
    pub phase: Phase,
    /// Human-readable message.
    pub message: String,
    /// Rough completion percentage.
    pub progress: u8,
    /// When the event was emitted.
    pub at: DateTime<Utc>,
}

struct Inner {
    sender: broadcast::Sender<ProgressEvent>,
    current: DashMap<TaskId, ProgressEvent>,
    seq: AtomicU64,
}

/// Fans progress events out to live subscribers.
#[derive(Clone)]
pub struct ProgressReporter {
    inner: Arc<Inner>,
}

impl ProgressReporter {
    /// Create a reporter whose subscribers may fall `capacity` events behind.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                sender,
                current: DashMap::new(),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Publish an event for `task`.
    pub fn emit(&self, task: &TaskId, phase: Phase, message: impl Into<String>) -> ProgressEvent {
        let event = ProgressEvent {
            task_id: task.clone(),
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed) + 1,
            phase,
            message: message.into(),
            progress: phase.progress(),
            at: Utc::now(),
        };
        debug!(task_id = %task, phase = %phase, message = %event.message, "progress");

        self.inner.current.insert(task.clone(), event.clone());
        // No receivers is not an error.
        let _ = self.inner.sender.send(event.clone());
        event
    }

    /// Follow one task, starting from its latest event.
    #[must_use]
    pub fn subscribe(&self, task: &TaskId) -> Subscription {
        // Subscribe before reading the snapshot so nothing falls in between.
        let receiver = self.inner.sender.subscribe();
        let snapshot = self.status(task);
        Subscription {
            reporter: self.clone(),
            task: task.clone(),
            receiver,
            last_seq: 0,
            pending: snapshot,
            finished: false,
        }
    }

    /// Follow every task.
    #[must_use]
    pub fn subscribe_all(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.sender.subscribe()
    }

    /// Latest event for `task`.
    #[must_use]
    pub fn status(&self, task: &TaskId) -> Option<ProgressEvent> {
        self.inner.current.get(task).map(|e| e.value().clone())
    }

    /// Drop the snapshot for `task`.
    pub fn forget(&self, task: &TaskId) {
        self.inner.current.remove(task);
    }

    /// Number of live receivers.
    #[must_use]
    pub fn subscribers(&self) -> usize {
        self.inner.sender.receiver_count()
    }

    /// Handle for emitting events for one task.
    #[must_use]
    pub fn task(&self, task: TaskId) -> TaskProgress {
        TaskProgress {
            reporter: self.clone(),
            task,
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("tasks", &self.inner.current.len())
            .field("subscribers", &self.subscribers())
            .finish()
    }
}

/// Emits events for a single task.
#[derive(Debug, Clone)]
pub struct TaskProgress {
    reporter: ProgressReporter,
    task: TaskId,
}

impl TaskProgress {
    /// Task this handle reports for.
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        &self.task
    }

    /// Announce that the task entered `phase`.
    pub fn phase(&self, phase: Phase, message: impl Into<String>) -> ProgressEvent {
        self.reporter.emit(&self.task, phase, message)
    }

    /// Phase of the latest event.
    #[must_use]
    pub fn current(&self) -> Option<Phase> {
        self.reporter.status(&self.task).map(|e| e.phase)
    }
}

/// Event stream for one task.
#[derive(Debug)]
pub struct Subscription {
    reporter: ProgressReporter,
    task: TaskId,
    receiver: broadcast::Receiver<ProgressEvent>,
    last_seq: u64,
    pending: Option<ProgressEvent>,
    finished: bool,
}

impl Subscription {
    /// Next event for the task, or `None` once the task has finished.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if let Some(event) = self.pending.take() {
            return Some(self.accept(event));
        }
        if self.finished {
            return None;
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.task_id != self.task || event.seq <= self.last_seq {
                        continue;
                    }
                    return Some(self.accept(event));
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(task_id = %self.task, skipped, "progress subscriber lagged");
                    // The skipped events may have included this task's last one.
                    match self.reporter.status(&self.task) {
                        Some(latest) if latest.seq > self.last_seq => {
                            return Some(self.accept(latest));
                        }
                        Some(_) => {}
                        // Forgotten, so it finished long ago.
                        None => {
                            self.finished = true;
                            return None;
                        }
                    }
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    fn accept(&mut self, event: ProgressEvent) -> ProgressEvent {
        self.last_seq = event.seq;
        self.finished = event.phase.is_final();
        event
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let reporter = ProgressReporter::new(16);
        let task = TaskId::new("task-a");
        let mut sub = reporter.subscribe(&task);

        let progress = reporter.task(task.clone());
        progress.phase(Phase::Classify, "classifying");
        progress.phase(Phase::Render, "rendering");
        progress.phase(Phase::Completed, "done");

        let mut phases = Vec::new();
        while let Some(event) = sub.next().await {
            phases.push(event.phase);
        }
        assert_eq!(phases, vec![Phase::Classify, Phase::Render, Phase::Completed]);
    }

    #[tokio::test]
    async fn late_subscriber_sees_current_phase_only() {
        let reporter = ProgressReporter::new(16);
        let task = TaskId::new("task-a");
        reporter.emit(&task, Phase::Classify, "classifying");
        reporter.emit(&task, Phase::Build, "building");

        let mut sub = reporter.subscribe(&task);
        let first = sub.next().await.unwrap();
        assert_eq!(first.phase, Phase::Build);

        reporter.emit(&task, Phase::Failed, "boom");
        assert_eq!(sub.next().await.unwrap().phase, Phase::Failed);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn lagged_subscriber_still_sees_final_event() {
        let reporter = ProgressReporter::new(1);
        let mine = TaskId::new("task-a");
        let other = TaskId::new("task-b");
        let mut sub = reporter.subscribe(&mine);

        reporter.emit(&mine, Phase::Completed, "done");
        reporter.emit(&other, Phase::Classify, "classifying");
        reporter.emit(&other, Phase::Render, "rendering");

        let event = tokio::time::timeout(Duration::from_millis(500), sub.next())
            .await
            .expect("subscription stalled after lagging")
            .unwrap();
        assert_eq!(event.phase, Phase::Completed);
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn subscription_ignores_other_tasks() {
        let reporter = ProgressReporter::new(16);
        let mine = TaskId::new("task-a");
        let other = TaskId::new("task-b");
        let mut sub = reporter.subscribe(&mine);

        reporter.emit(&other, Phase::Render, "other");
        reporter.emit(&mine, Phase::Completed, "mine");

        let event = sub.next().await.unwrap();
        assert_eq!(event.task_id, mine);
        assert_eq!(event.message, "mine");
    }

    #[tokio::test]
    async fn stalled_subscriber_does_not_block_emit() {
        let reporter = ProgressReporter::new(4);
        let task = TaskId::new("task-a");
        let mut sub = reporter.subscribe(&task);

        let emitted = tokio::time::timeout(Duration::from_secs(1), async {
            for i in 0..10_000 {
                reporter.emit(&task, Phase::Verify, format!("attempt {i}"));
            }
            reporter.emit(&task, Phase::Completed, "done");
        })
        .await;
        assert!(emitted.is_ok());

        let mut last = None;
        while let Some(event) = sub.next().await {
            last = Some(event.phase);
        }
        assert_eq!(last, Some(Phase::Completed));
    }

    #[tokio::test]
    async fn status_tracks_latest_event() {
        let reporter = ProgressReporter::default();
        let task = TaskId::new("task-a");
        assert!(reporter.status(&task).is_none());

        reporter.emit(&task, Phase::Run, "starting container");
        let status = reporter.status(&task).unwrap();
        assert_eq!(status.phase, Phase::Run);
        assert_eq!(status.progress, 60);

        reporter.forget(&task);
        assert!(reporter.status(&task).is_none());
    }
}
