//! Background job tracking for one connect attempt.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use parking_lot::Mutex;
use switch_transport::TransportError;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::client::ClientError;
use crate::countdown::Countdown;
use crate::metrics;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("job '{task}' failed: {message}")]
    JobFailed { task: String, message: String },
}

/// First unexpected failure recorded by a supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub task: String,
    pub message: String,
    /// The job failed because the switch became unreachable.
    pub unavailable: bool,
}

struct TaskRecord {
    name: String,
    background: bool,
    token: CancellationToken,
}

pub struct TaskHandle {
    name: String,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the job to end, however it ends.
    pub async fn join(self) {
        let _ = self.join.await;
    }
}

#[derive(Clone)]
pub struct TaskSupervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    label: String,
    fail_fast: bool,
    next_id: AtomicU64,
    tasks: Mutex<HashMap<u64, TaskRecord>>,
    countdown: Countdown,
    failure: watch::Sender<Option<JobFailure>>,
    escalated: AtomicBool,
}

enum Outcome {
    Completed,
    Cancelled,
    Failed(anyhow::Error),
}

impl TaskSupervisor {
    /// `label` names the owning session in logs.
    pub fn new(label: impl Into<String>, fail_fast: bool) -> Self {
        let label = label.into();
        let inner = Arc::new_cyclic(|weak: &Weak<SupervisorInner>| {
            let weak = weak.clone();
            let (failure, _) = watch::channel(None);
            SupervisorInner {
                label,
                fail_fast,
                next_id: AtomicU64::new(0),
                tasks: Mutex::new(HashMap::new()),
                countdown: Countdown::with_cancel_hook(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.cancel_matching(|_| true);
                    }
                }),
                failure,
                escalated: AtomicBool::new(false),
            }
        });
        Self { inner }
    }

    /// Track a job. Foreground jobs are cancelled on role transitions;
    /// background jobs only on teardown.
    pub fn spawn<F>(&self, name: impl Into<String>, background: bool, job: F) -> TaskHandle
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let guard = self.inner.countdown.enter();
        self.inner.tasks.lock().insert(
            id,
            TaskRecord {
                name: name.clone(),
                background,
                token: token.clone(),
            },
        );
        debug!(
            target: "switchyard::supervisor",
            session = %self.inner.label,
            task = %name,
            background,
            "task spawned"
        );

        let inner = self.inner.clone();
        let task_token = token.clone();
        let task_name = name.clone();
        let job = crate::controller::inherit_current(job);
        let join = tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = task_token.cancelled() => Outcome::Cancelled,
                result = AssertUnwindSafe(job).catch_unwind() => match result {
                    Ok(Ok(())) => Outcome::Completed,
                    Ok(Err(err)) => Outcome::Failed(err),
                    Err(panic) => Outcome::Failed(anyhow::anyhow!(
                        "panicked: {}",
                        panic_message(panic.as_ref())
                    )),
                },
            };
            inner.finish(id, &task_name, outcome);
            drop(guard);
        });

        TaskHandle { name, token, join }
    }

    pub fn cancel_all(&self) {
        self.inner.cancel_matching(|_| true);
    }

    pub fn cancel_foreground(&self) {
        self.inner.cancel_matching(|record| !record.background);
    }

    /// Cancel everything and wait for the jobs to actually stop.
    pub async fn shutdown(&self) {
        self.inner.countdown.cancel();
        self.cancel_all();
        self.inner.countdown.wait().await;
    }

    /// Resolve once every tracked job has finished. With fail-fast, an
    /// unexpected failure is reported here exactly once.
    pub async fn wait(&self) -> Result<(), SupervisorError> {
        self.inner.countdown.wait().await;
        self.escalation().map_or(Ok(()), Err)
    }

    /// The pending fail-fast error, if any. Reported once.
    pub fn escalation(&self) -> Option<SupervisorError> {
        if !self.inner.fail_fast {
            return None;
        }
        let failure = self.first_failure()?;
        if self.inner.escalated.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(SupervisorError::JobFailed {
            task: failure.task,
            message: failure.message,
        })
    }

    /// Resolve when a job fails unexpectedly.
    pub async fn failed(&self) -> JobFailure {
        let mut rx = self.inner.failure.subscribe();
        loop {
            if let Some(failure) = rx.borrow_and_update().clone() {
                return failure;
            }
            if rx.changed().await.is_err() {
                return futures::future::pending().await;
            }
        }
    }

    pub fn first_failure(&self) -> Option<JobFailure> {
        self.inner.failure.borrow().clone()
    }

    pub fn is_fail_fast(&self) -> bool {
        self.inner.fail_fast
    }

    pub fn len(&self) -> usize {
        self.inner.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .tasks
            .lock()
            .values()
            .map(|record| record.name.clone())
            .collect();
        names.sort();
        names
    }
}

impl SupervisorInner {
    fn cancel_matching(&self, pick: impl Fn(&TaskRecord) -> bool) {
        let tasks = self.tasks.lock();
        for record in tasks.values().filter(|record| pick(record)) {
            record.token.cancel();
        }
    }

    fn finish(&self, id: u64, name: &str, outcome: Outcome) {
        self.tasks.lock().remove(&id);
        match outcome {
            Outcome::Completed => {
                debug!(target: "switchyard::supervisor", session = %self.label, task = %name, "task finished");
            }
            Outcome::Cancelled => {
                debug!(target: "switchyard::supervisor", session = %self.label, task = %name, "task cancelled");
            }
            Outcome::Failed(err) => {
                let unavailable = is_unavailable(&err);
                if unavailable {
                    warn!(
                        target: "switchyard::supervisor",
                        session = %self.label,
                        task = %name,
                        error = %err,
                        "task stopped: switch unavailable"
                    );
                    metrics::JOB_FAILURES.with_label_values(&["unavailable"]).inc();
                } else {
                    error!(
                        target: "switchyard::supervisor",
                        session = %self.label,
                        task = %name,
                        error = ?err,
                        "task failed"
                    );
                    metrics::JOB_FAILURES.with_label_values(&["error"]).inc();
                }

                let recorded = self.failure.send_if_modified(|slot| {
                    if slot.is_some() {
                        return false;
                    }
                    *slot = Some(JobFailure {
                        task: name.to_string(),
                        message: format!("{err:#}"),
                        unavailable,
                    });
                    true
                });
                if recorded {
                    self.cancel_matching(|_| true);
                }
            }
        }
    }
}

fn is_unavailable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<ClientError>()
            .is_some_and(ClientError::is_unavailable)
            || cause
                .downcast_ref::<TransportError>()
                .is_some_and(TransportError::is_unavailable)
    })
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use switch_transport::Code;

    use crate::client::ClientErrorKind;

    #[tokio::test]
    async fn successful_jobs_wait_cleanly() {
        let supervisor = TaskSupervisor::new("s1", true);
        for i in 0..4u64 {
            supervisor.spawn(format!("job-{i}"), false, async move {
                tokio::time::sleep(Duration::from_millis(i)).await;
                Ok(())
            });
        }
        supervisor.wait().await.expect("no failures");
        assert!(supervisor.is_empty());
        assert!(supervisor.first_failure().is_none());
    }

    #[tokio::test]
    async fn first_failure_cancels_siblings_and_escalates_once() {
        let supervisor = TaskSupervisor::new("s1", true);
        let sleepers: Vec<TaskHandle> = (0..3)
            .map(|i| {
                supervisor.spawn(format!("sleeper-{i}"), i == 0, async {
                    futures::future::pending::<()>().await;
                    Ok(())
                })
            })
            .collect();
        supervisor.spawn("broken", false, async {
            tokio::task::yield_now().await;
            anyhow::bail!("boom")
        });

        let failure = supervisor.failed().await;
        assert_eq!(failure.task, "broken");
        assert!(!failure.unavailable);

        let err = supervisor.wait().await.expect_err("fail-fast escalates");
        assert_eq!(
            err,
            SupervisorError::JobFailed {
                task: "broken".into(),
                message: "boom".into()
            }
        );
        assert!(sleepers.iter().all(TaskHandle::is_finished));
        assert!(supervisor.wait().await.is_ok(), "escalation is reported once");
    }

    #[tokio::test]
    async fn failure_without_fail_fast_is_absorbed() {
        let supervisor = TaskSupervisor::new("s1", false);
        supervisor.spawn("broken", false, async { anyhow::bail!("nope") });
        supervisor.wait().await.expect("absorbed");
        assert_eq!(
            supervisor.first_failure().map(|f| f.task),
            Some("broken".to_string())
        );
    }

    #[tokio::test]
    async fn unavailable_failures_are_flagged() {
        let supervisor = TaskSupervisor::new("s1", false);
        supervisor.spawn("reader", true, async {
            Err(ClientError::new(ClientErrorKind::Transport, Code::Unavailable, "gone").into())
        });
        let failure = supervisor.failed().await;
        assert!(failure.unavailable);
    }

    #[tokio::test]
    async fn panics_count_as_failures() {
        let supervisor = TaskSupervisor::new("s1", true);
        supervisor.spawn("panicky", false, async {
            panic!("kaboom");
        });
        let err = supervisor.wait().await.expect_err("panic escalates");
        assert!(err.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn cancel_foreground_keeps_background_jobs() {
        let supervisor = TaskSupervisor::new("s1", false);
        let background = supervisor.spawn("poller", true, async {
            futures::future::pending::<()>().await;
            Ok(())
        });
        let foreground = supervisor.spawn("app", false, async {
            futures::future::pending::<()>().await;
            Ok(())
        });

        supervisor.cancel_foreground();
        foreground.join().await;
        assert!(!background.is_finished());
        assert_eq!(supervisor.task_names(), vec!["poller".to_string()]);

        supervisor.shutdown().await;
        assert!(supervisor.is_empty());
        assert!(supervisor.first_failure().is_none());
    }
}
