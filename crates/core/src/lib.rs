//! Domain types shared between the storage layer, the HTTP surface and the
//! background workers.

pub mod types;

pub use types::{synthetic_address, EmailAddress, EmailAddressError, Job, ProcessedEmail};
