use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use thiserror::Error;
use tracing::{debug, info};

use mailcheck_core::types::{synthetic_address, EmailAddress, EmailAddressError, Job};
use mailcheck_storage::{Database, NewProcessedEmail, ProcessedEmailError};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Runs the bodies of the background jobs against the record store.
#[derive(Clone)]
pub struct TaskRunner {
    database: Database,
    clock: Clock,
}

impl TaskRunner {
    pub fn new(database: Database) -> Self {
        Self {
            database,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Dispatches `job` to its task body. `Ok(None)` means the task reports no message.
    pub async fn run(&self, job: &Job) -> Result<Option<String>, TaskError> {
        match job {
            Job::TestScheduledTask { arg } => {
                self.test_scheduled_task(arg);
                Ok(None)
            }
            Job::CreateProcessedEmails { count } => {
                self.create_processed_emails(*count).await.map(Some)
            }
            Job::VerifyProcessedEmails => self.verify_processed_emails().await.map(Some),
        }
    }

    pub fn test_scheduled_task(&self, arg: &str) {
        info!(stage = "worker", task = "test_scheduled_task", %arg, "{arg}");
    }

    /// Inserts `count` synthetic records, one write each. A failed write stops the
    /// loop; rows written before it stay.
    pub async fn create_processed_emails(&self, count: i64) -> Result<String, TaskError> {
        let repo = self.database.processed_emails();
        for index in 0..count.max(0) as u64 {
            let email = synthetic_address(index);
            info!(stage = "worker", task = "create_processed_emails", "creating {email}");
            let email = EmailAddress::parse(&email)?;
            repo.create(NewProcessedEmail {
                email,
                timestamp: (self.clock)(),
            })
            .await?;
            counter!("processed_emails_created_total").increment(1);
        }
        Ok(format!("Done processing {count} emails!"))
    }

    /// Marks every stored record verified, rewriting rows that already are.
    pub async fn verify_processed_emails(&self) -> Result<String, TaskError> {
        let repo = self.database.processed_emails();
        let records = repo.list_all().await?;
        let total = records.len();
        for mut record in records {
            record.is_verified = true;
            repo.save(&record).await?;
            counter!("processed_emails_verified_total").increment(1);
        }
        debug!(stage = "worker", task = "verify_processed_emails", total, "records verified");
        Ok("Emails verified successfully!".to_string())
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid email address: {0}")]
    InvalidEmail(#[from] EmailAddressError),
    #[error("storage error: {0}")]
    Storage(#[from] ProcessedEmailError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    async fn setup_db() -> Database {
        let db = Database::connect("sqlite::memory:")
            .await
            .expect("connect");
        db.run_migrations().await.expect("migrations");
        db
    }

    fn fixed_clock() -> Clock {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        Arc::new(move || now)
    }

    #[tokio::test]
    async fn populate_inserts_sequential_addresses() {
        let db = setup_db().await;
        let runner = TaskRunner::new(db.clone()).with_clock(fixed_clock());

        let message = runner.create_processed_emails(3).await.expect("populate");
        assert_eq!(message, "Done processing 3 emails!");

        let records = db.processed_emails().list_all().await.expect("list");
        let emails: Vec<&str> = records.iter().map(|r| r.email.as_str()).collect();
        assert_eq!(
            emails,
            vec!["email0@gmail.com", "email1@gmail.com", "email2@gmail.com"]
        );
        assert!(records.iter().all(|r| !r.is_verified));
        assert!(records.iter().all(|r| r.timestamp == (fixed_clock())()));
    }

    #[tokio::test]
    async fn populate_with_zero_or_negative_count_inserts_nothing() {
        let db = setup_db().await;
        let runner = TaskRunner::new(db.clone());

        let zero = runner.create_processed_emails(0).await.expect("zero");
        assert_eq!(zero, "Done processing 0 emails!");
        let negative = runner.create_processed_emails(-4).await.expect("negative");
        assert_eq!(negative, "Done processing -4 emails!");

        assert_eq!(db.processed_emails().count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn repeated_populate_duplicates_addresses() {
        let db = setup_db().await;
        let runner = TaskRunner::new(db.clone());

        runner.create_processed_emails(2).await.expect("first");
        runner.create_processed_emails(2).await.expect("second");

        let records = db.processed_emails().list_all().await.expect("list");
        assert_eq!(records.len(), 4);
        assert_eq!(
            records.iter().filter(|r| r.email == "email0@gmail.com").count(),
            2
        );
    }

    #[tokio::test]
    async fn populate_stops_at_failed_write_and_keeps_earlier_rows() {
        let db = setup_db().await;
        sqlx::query(
            "CREATE TRIGGER reject_third_email BEFORE INSERT ON processed_emails \
             WHEN NEW.email = 'email2@gmail.com' \
             BEGIN SELECT RAISE(ABORT, 'email2 rejected'); END;",
        )
        .execute(db.pool())
        .await
        .expect("create trigger");
        let runner = TaskRunner::new(db.clone());

        let result = runner.create_processed_emails(5).await;
        assert!(matches!(result, Err(TaskError::Storage(_))));

        let records = db.processed_emails().list_all().await.expect("list");
        assert_eq!(db.processed_emails().count().await.expect("count"), 2);
        let emails: Vec<&str> = records.iter().map(|r| r.email.as_str()).collect();
        assert_eq!(emails, vec!["email0@gmail.com", "email1@gmail.com"]);
    }

    #[tokio::test]
    async fn verify_marks_every_record_and_keeps_count() {
        let db = setup_db().await;
        let runner = TaskRunner::new(db.clone());
        runner.create_processed_emails(3).await.expect("populate");

        let message = runner.verify_processed_emails().await.expect("verify");
        assert_eq!(message, "Emails verified successfully!");

        let records = db.processed_emails().list_all().await.expect("list");
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.is_verified));
    }

    #[tokio::test]
    async fn verify_twice_changes_nothing() {
        let db = setup_db().await;
        let runner = TaskRunner::new(db.clone()).with_clock(fixed_clock());
        runner.create_processed_emails(2).await.expect("populate");

        runner.verify_processed_emails().await.expect("first verify");
        let after_first = db.processed_emails().list_all().await.expect("list");
        runner.verify_processed_emails().await.expect("second verify");
        let after_second = db.processed_emails().list_all().await.expect("list");

        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn verify_on_empty_store_succeeds() {
        let db = setup_db().await;
        let runner = TaskRunner::new(db);
        let message = runner.verify_processed_emails().await.expect("verify");
        assert_eq!(message, "Emails verified successfully!");
    }

    #[tokio::test]
    async fn run_dispatches_by_job() {
        let db = setup_db().await;
        let runner = TaskRunner::new(db.clone());

        let heartbeat = runner
            .run(&Job::TestScheduledTask {
                arg: "ping".to_string(),
            })
            .await
            .expect("heartbeat");
        assert_eq!(heartbeat, None);

        let populate = runner
            .run(&Job::CreateProcessedEmails { count: 1 })
            .await
            .expect("populate");
        assert_eq!(populate.as_deref(), Some("Done processing 1 emails!"));

        let verify = runner
            .run(&Job::VerifyProcessedEmails)
            .await
            .expect("verify");
        assert_eq!(verify.as_deref(), Some("Emails verified successfully!"));
        assert!(db.processed_emails().list_all().await.expect("list")[0].is_verified);
    }
}
