//! In-process job queue.
//!
//! [`JobQueue`] is the client side: handlers call [`JobQueue::submit`] and get
//! a [`JobHandle`] back without waiting for the job. [`JobWorker`] drains the
//! channel and runs jobs on spawned tasks, bounded by a semaphore.

use std::{sync::Arc, time::Instant};

use chrono::{DateTime, Utc};
use metrics::{counter, histogram};
use serde_json::json;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use mailcheck_core::types::Job;

use crate::tap::{StageEvent, StageKind, TapHub};
use crate::tasks::TaskRunner;

/// A job waiting in the channel together with its completion sender.
pub struct QueuedJob {
    id: Uuid,
    job: Job,
    submitted_at: DateTime<Utc>,
    reply: oneshot::Sender<JobReport>,
}

impl QueuedJob {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn job(&self) -> &Job {
        &self.job
    }
}

/// Final state of one executed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded(Option<String>),
    Failed(String),
}

impl JobOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobReport {
    pub id: Uuid,
    pub task: &'static str,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: JobOutcome,
}

/// Returned by [`JobQueue::submit`]. Dropping it leaves the job running.
#[derive(Debug)]
pub struct JobHandle {
    id: Uuid,
    task: &'static str,
    completion: oneshot::Receiver<JobReport>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task(&self) -> &'static str {
        self.task
    }

    /// Waits for the worker to finish the job.
    pub async fn wait(self) -> Result<JobReport, JobWaitError> {
        let id = self.id;
        self.completion.await.map_err(|_| JobWaitError::Abandoned(id))
    }
}

#[derive(Debug, Error)]
pub enum JobWaitError {
    #[error("job {0} was dropped before it reported completion")]
    Abandoned(Uuid),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("job queue is full")]
    QueueFull,
    #[error("job queue is closed")]
    Closed,
}

impl SubmitError {
    fn label(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
        }
    }
}

/// Cloneable submission side of the job queue.
#[derive(Clone)]
pub struct JobQueue {
    sender: mpsc::Sender<QueuedJob>,
    tap: TapHub,
}

/// Receiving side of the job queue, consumed by [`JobWorker`].
pub struct JobReceiver {
    receiver: mpsc::Receiver<QueuedJob>,
}

impl JobReceiver {
    pub async fn recv(&mut self) -> Option<QueuedJob> {
        self.receiver.recv().await
    }
}

impl JobQueue {
    pub fn new(capacity: usize, tap: TapHub) -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender, tap }, JobReceiver { receiver })
    }

    /// Enqueues `job` without waiting for capacity or for the job to run.
    pub fn submit(&self, job: Job) -> Result<JobHandle, SubmitError> {
        let id = Uuid::new_v4();
        let task = job.name();
        let (reply, completion) = oneshot::channel();
        let queued = QueuedJob {
            id,
            job,
            submitted_at: Utc::now(),
            reply,
        };

        let result = self.sender.try_send(queued).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SubmitError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        });

        match result {
            Ok(()) => {
                counter!("jobs_submitted_total", "task" => task, "result" => "accepted")
                    .increment(1);
                info!(stage = "queue", %id, task, "job submitted");
                self.tap
                    .publish(StageEvent::new(StageKind::Queue, "job.submitted").with_job(id, task));
                Ok(JobHandle {
                    id,
                    task,
                    completion,
                })
            }
            Err(err) => {
                counter!("jobs_submitted_total", "task" => task, "result" => err.label())
                    .increment(1);
                warn!(stage = "queue", task, error = %err, "job submission rejected");
                self.tap.publish(
                    StageEvent::new(StageKind::Queue, "job.rejected")
                        .with_job(id, task)
                        .with_detail(json!({ "reason": err.label() })),
                );
                Err(err)
            }
        }
    }
}

/// Pulls jobs off the queue and runs up to `concurrency` of them at a time.
pub struct JobWorker {
    receiver: JobReceiver,
    runner: TaskRunner,
    tap: TapHub,
    concurrency: usize,
}

impl JobWorker {
    pub fn new(receiver: JobReceiver, runner: TaskRunner, tap: TapHub, concurrency: usize) -> Self {
        Self {
            receiver,
            runner,
            tap,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs the dispatch loop in the background until every [`JobQueue`] is dropped.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run_loop())
    }

    async fn run_loop(mut self) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        info!(stage = "worker", concurrency = self.concurrency, "job worker started");

        while let Some(queued) = self.receiver.recv().await {
            debug!(stage = "worker", id = %queued.id(), task = queued.job().name(), "job dequeued");
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let runner = self.runner.clone();
            let tap = self.tap.clone();
            tokio::spawn(async move {
                execute(&runner, &tap, queued).await;
                drop(permit);
            });
        }

        info!(stage = "worker", "job queue closed, worker exiting");
    }
}

async fn execute(runner: &TaskRunner, tap: &TapHub, queued: QueuedJob) {
    let QueuedJob {
        id,
        job,
        submitted_at,
        reply,
    } = queued;
    let task = job.name();

    tap.publish(StageEvent::new(StageKind::Worker, "job.started").with_job(id, task));
    let start = Instant::now();
    let outcome = match runner.run(&job).await {
        Ok(message) => JobOutcome::Succeeded(message),
        Err(err) => JobOutcome::Failed(err.to_string()),
    };
    let duration = start.elapsed().as_secs_f64();

    histogram!("job_duration_seconds", "task" => task).record(duration);
    counter!("jobs_finished_total", "task" => task, "outcome" => outcome.label()).increment(1);

    match &outcome {
        JobOutcome::Succeeded(message) => {
            info!(stage = "worker", %id, task, duration_secs = duration, result = ?message, "job finished");
        }
        JobOutcome::Failed(reason) => {
            error!(stage = "worker", %id, task, duration_secs = duration, error = %reason, "job failed");
        }
    }
    tap.publish(
        StageEvent::new(StageKind::Worker, format!("job.{}", outcome.label()))
            .with_job(id, task)
            .with_detail(json!({ "duration_secs": duration })),
    );

    let report = JobReport {
        id,
        task,
        submitted_at,
        finished_at: Utc::now(),
        outcome,
    };
    // Fire-and-forget submitters have already dropped the receiver.
    let _ = reply.send(report);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use mailcheck_storage::Database;
    use tokio::time::timeout;

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    #[tokio::test]
    async fn submitted_jobs_run_and_report() {
        let db = setup_db().await;
        let tap = TapHub::new();
        let (queue, receiver) = JobQueue::new(8, tap.clone());
        JobWorker::new(receiver, TaskRunner::new(db.clone()), tap, 2).spawn();

        let populate = queue
            .submit(Job::CreateProcessedEmails { count: 3 })
            .expect("submit populate");
        assert_eq!(populate.task(), "create_processed_emails");
        let report = timeout(Duration::from_secs(5), populate.wait())
            .await
            .expect("populate finished in time")
            .expect("populate report");
        assert_eq!(
            report.outcome,
            JobOutcome::Succeeded(Some("Done processing 3 emails!".to_string()))
        );

        let verify = queue
            .submit(Job::VerifyProcessedEmails)
            .expect("submit verify");
        let verify_id = verify.id();
        let report = timeout(Duration::from_secs(5), verify.wait())
            .await
            .expect("verify finished in time")
            .expect("verify report");
        assert_eq!(report.id, verify_id);
        assert!(report.finished_at >= report.submitted_at);
        assert_eq!(
            report.outcome,
            JobOutcome::Succeeded(Some("Emails verified successfully!".to_string()))
        );

        let records = db.processed_emails().list_all().await.expect("list");
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.is_verified));
    }

    #[tokio::test]
    async fn failed_jobs_report_failure() {
        let db = setup_db().await;
        db.pool().close().await;
        let tap = TapHub::new();
        let (queue, receiver) = JobQueue::new(4, tap.clone());
        JobWorker::new(receiver, TaskRunner::new(db), tap, 1).spawn();

        let handle = queue
            .submit(Job::VerifyProcessedEmails)
            .expect("submit verify");
        let report = timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("finished in time")
            .expect("report");
        assert!(matches!(report.outcome, JobOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn submit_rejects_when_full() {
        let (queue, _receiver) = JobQueue::new(1, TapHub::new());
        queue
            .submit(Job::VerifyProcessedEmails)
            .expect("first fits");
        let err = queue.submit(Job::VerifyProcessedEmails).unwrap_err();
        assert_eq!(err, SubmitError::QueueFull);
    }

    #[tokio::test]
    async fn submit_rejects_when_closed() {
        let (queue, receiver) = JobQueue::new(4, TapHub::new());
        drop(receiver);
        let err = queue.submit(Job::VerifyProcessedEmails).unwrap_err();
        assert_eq!(err, SubmitError::Closed);
    }

    #[tokio::test]
    async fn submit_publishes_tap_event() {
        let tap = TapHub::new();
        let mut events = tap.subscribe();
        let (queue, mut receiver) = JobQueue::new(4, tap);

        let handle = queue
            .submit(Job::TestScheduledTask {
                arg: "ping".to_string(),
            })
            .expect("submit");

        let event = events.recv().await.expect("tap event");
        assert_eq!(event.stage, StageKind::Queue);
        assert_eq!(event.message, "job.submitted");
        assert_eq!(event.job_id, Some(handle.id().to_string()));

        let queued = receiver.recv().await.expect("queued job");
        assert_eq!(queued.id(), handle.id());
        assert_eq!(
            queued.job(),
            &Job::TestScheduledTask {
                arg: "ping".to_string()
            }
        );
    }
}
