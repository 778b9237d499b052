use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use mailcheck_core::types::Job;
use mailcheck_util::HeartbeatSchedule;

use crate::queue::{JobHandle, JobQueue, SubmitError};
use crate::tap::{StageEvent, StageKind, TapHub};

/// Periodically submits the diagnostic heartbeat job.
#[derive(Clone)]
pub struct HeartbeatScheduler {
    queue: JobQueue,
    tap: TapHub,
    interval: Duration,
    message: String,
}

impl HeartbeatScheduler {
    pub fn new(queue: JobQueue, tap: TapHub, schedule: HeartbeatSchedule) -> Self {
        Self {
            queue,
            tap,
            interval: schedule.interval,
            message: schedule.message,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop().await;
        })
    }

    async fn run_loop(self) {
        info!(
            stage = "scheduler",
            interval_secs = self.interval.as_secs(),
            "heartbeat scheduler started"
        );
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.run_once() {
                Ok(_) => {}
                Err(SubmitError::Closed) => {
                    warn!(stage = "scheduler", "job queue closed, stopping heartbeat scheduler");
                    break;
                }
                Err(err) => {
                    warn!(stage = "scheduler", error = %err, "heartbeat submission skipped");
                }
            }
        }
    }

    /// Submits one heartbeat job.
    pub fn run_once(&self) -> Result<JobHandle, SubmitError> {
        let handle = self.queue.submit(Job::TestScheduledTask {
            arg: self.message.clone(),
        })?;
        self.tap.publish(
            StageEvent::new(StageKind::Scheduler, "heartbeat.scheduled")
                .with_job(handle.id(), handle.task()),
        );
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn schedule(interval: Duration) -> HeartbeatSchedule {
        HeartbeatSchedule {
            interval,
            message: "heartbeat".to_string(),
        }
    }

    #[tokio::test]
    async fn run_once_submits_heartbeat_with_message() {
        let tap = TapHub::new();
        let (queue, mut receiver) = JobQueue::new(4, tap.clone());
        let scheduler = HeartbeatScheduler::new(queue, tap, schedule(Duration::from_secs(60)));

        let handle = scheduler.run_once().expect("submit heartbeat");
        let queued = receiver.recv().await.expect("queued heartbeat");
        assert_eq!(queued.id(), handle.id());
        assert_eq!(
            queued.job(),
            &Job::TestScheduledTask {
                arg: "heartbeat".to_string()
            }
        );
    }

    #[tokio::test]
    async fn loop_submits_on_every_tick() {
        let tap = TapHub::new();
        let (queue, mut receiver) = JobQueue::new(16, tap.clone());
        let task = HeartbeatScheduler::new(queue, tap, schedule(Duration::from_millis(10))).spawn();

        for _ in 0..2 {
            let queued = timeout(Duration::from_secs(1), receiver.recv())
                .await
                .expect("heartbeat arrived in time")
                .expect("queue open");
            assert_eq!(queued.job().name(), "test_scheduled_task");
        }
        task.abort();
    }

    #[tokio::test]
    async fn loop_stops_when_queue_closes() {
        let tap = TapHub::new();
        let (queue, receiver) = JobQueue::new(4, tap.clone());
        drop(receiver);
        let task = HeartbeatScheduler::new(queue, tap, schedule(Duration::from_millis(5))).spawn();

        timeout(Duration::from_secs(1), task)
            .await
            .expect("scheduler stopped")
            .expect("scheduler task did not panic");
    }
}
