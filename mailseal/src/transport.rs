use crate::address::EmailAddress;
use crate::blocklist::BlockedAddressEntry;
use crate::error::{MailError, Result};
use crate::keys::KeyRef;
use crate::models::{
    AccountId, EmailAddressId, MessageId, ProvisionedAddress, SendReceipt, StoredMessage,
};
use crate::sealing::SealedEnvelope;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Date field a query is ranged and ordered by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DateField {
    #[default]
    SortDate,
    UpdatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    #[default]
    Descending,
}

/// Inclusive date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn validate(&self) -> Result<()> {
        if self.start > self.end {
            return Err(MailError::InvalidArgument(format!(
                "date range start {} is after end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

/// Opaque pagination cursor issued by the storage collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageToken(pub String);

/// Fully validated query as sent to storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageQuery {
    /// Identities whose mail is listed. Empty matches nothing.
    pub owners: BTreeSet<EmailAddressId>,
    pub date_field: DateField,
    pub date_range: Option<DateRange>,
    pub order: SortOrder,
    pub limit: usize,
    pub next_token: Option<PageToken>,
    pub include_deleted: bool,
}

#[derive(Debug, Clone)]
pub struct StoragePage {
    pub items: Vec<StoredMessage>,
    pub next_token: Option<PageToken>,
}

/// Envelope plus routing metadata handed to the transport on send.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub sender_id: EmailAddressId,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub envelope: SealedEnvelope,
    /// Deferred delivery time; `None` sends now.
    pub send_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Register a new identity and publish its public key.
    async fn provision(&self, address: &EmailAddress, key: &KeyRef)
        -> Result<ProvisionedAddress>;

    async fn deprovision(&self, id: &EmailAddressId) -> Result<ProvisionedAddress>;

    async fn send(&self, message: OutboundMessage) -> Result<SendReceipt>;

    async fn list(&self, query: &StorageQuery) -> Result<StoragePage>;

    async fn get(&self, id: &MessageId) -> Result<Option<StoredMessage>>;

    /// Soft delete. `NotFound` when absent or already deleted.
    async fn delete(&self, id: &MessageId) -> Result<()>;

    /// `NotFound` when absent or deleted.
    async fn set_seen(&self, id: &MessageId, seen: bool) -> Result<()>;
}

#[async_trait]
pub trait BlocklistStore: Send + Sync {
    /// Insert or replace the entry keyed by
    /// `(account, hashed_value, owner_scope)`.
    async fn put_blocked(&self, account: &AccountId, entry: BlockedAddressEntry) -> Result<()>;

    /// Remove every entry of `account` with this hashed value; returns how
    /// many went.
    async fn remove_blocked(&self, account: &AccountId, hashed_value: &str) -> Result<usize>;

    async fn blocked(&self, account: &AccountId) -> Result<Vec<BlockedAddressEntry>>;
}
