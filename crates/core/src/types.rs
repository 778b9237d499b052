use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Longest address accepted, matching the RFC 5321 path limit.
pub const EMAIL_MAX_LEN: usize = 254;

const LABEL_MAX_LEN: usize = 63;

/// One email address tracked by the system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEmail {
    pub id: i64,
    pub email: String,
    pub is_verified: bool,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for ProcessedEmail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.email)
    }
}

/// A syntactically valid email address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EmailAddress(String);

impl EmailAddress {
    /// Validates `value` and wraps it.
    pub fn parse(value: &str) -> Result<Self, EmailAddressError> {
        if value.is_empty() {
            return Err(EmailAddressError::Empty);
        }
        if value.len() > EMAIL_MAX_LEN {
            return Err(EmailAddressError::TooLong(value.len()));
        }

        let (local, domain) = value
            .rsplit_once('@')
            .ok_or_else(|| EmailAddressError::MissingAt(value.to_string()))?;

        if !is_valid_local_part(local) {
            return Err(EmailAddressError::InvalidLocalPart(value.to_string()));
        }
        if !is_valid_domain(domain) {
            return Err(EmailAddressError::InvalidDomain(value.to_string()));
        }

        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl FromStr for EmailAddress {
    type Err = EmailAddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_valid_local_part(local: &str) -> bool {
    if local.is_empty() || local.starts_with('.') || local.ends_with('.') || local.contains("..")
    {
        return false;
    }
    local.chars().all(|c| {
        c.is_ascii_alphanumeric() || c == '.' || "!#$%&'*+/=?^_`{|}~-".contains(c)
    })
}

fn is_valid_domain(domain: &str) -> bool {
    if !domain.contains('.') {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= LABEL_MAX_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

/// Reasons an address fails validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmailAddressError {
    #[error("email address is empty")]
    Empty,
    #[error("email address is {0} characters long (max 254)")]
    TooLong(usize),
    #[error("email address '{0}' has no '@'")]
    MissingAt(String),
    #[error("email address '{0}' has an invalid local part")]
    InvalidLocalPart(String),
    #[error("email address '{0}' has an invalid domain")]
    InvalidDomain(String),
}

/// Builds the address used for the `index`-th synthetic record.
pub fn synthetic_address(index: u64) -> String {
    format!("email{index}@gmail.com")
}

/// Background jobs understood by the worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", content = "args", rename_all = "snake_case")]
pub enum Job {
    /// Heartbeat used to confirm that scheduling works end to end.
    TestScheduledTask { arg: String },
    /// Inserts `count` synthetic records. Zero or negative counts insert nothing.
    CreateProcessedEmails { count: i64 },
    /// Marks every stored record as verified.
    VerifyProcessedEmails,
}

impl Job {
    /// Returns the task name used in logs, metrics labels and the wire format.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TestScheduledTask { .. } => "test_scheduled_task",
            Self::CreateProcessedEmails { .. } => "create_processed_emails",
            Self::VerifyProcessedEmails => "verify_processed_emails",
        }
    }
}
