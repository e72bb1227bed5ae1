pub mod address;
pub mod batch;
pub mod blocklist;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod keys;
pub mod listing;
pub mod models;
pub mod recipients;
pub mod sealing;
pub mod storage;
pub mod transport;

pub use address::EmailAddress;
pub use client::{EmailClient, MessageOperation};
pub use config::CoreConfig;
pub use error::{ErrorKind, FailureCause, MailError, Result};
