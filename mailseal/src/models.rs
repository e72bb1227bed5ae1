use crate::address::EmailAddress;
use crate::keys::KeyId;
use crate::sealing::SealedEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier of one provisioned email address (an identity of the account).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EmailAddressId(pub String);

impl EmailAddressId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EmailAddressId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EmailAddressId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The account that owns a set of identities and their blocklist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub String);

impl AccountId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EncryptionStatus {
    Encrypted,
    Unencrypted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Lifecycle marker. `Deleted` is terminal and distinct from absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageState {
    Queued,
    Sent,
    Received,
    Deleted,
}

impl MessageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageState::Queued => "QUEUED",
            MessageState::Sent => "SENT",
            MessageState::Received => "RECEIVED",
            MessageState::Deleted => "DELETED",
        }
    }
}

/// Provisioned identity as returned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedAddress {
    pub id: EmailAddressId,
    pub address: EmailAddress,
    pub key_id: KeyId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub inline: bool,
    pub content_id: Option<String>,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn metadata(&self) -> AttachmentMeta {
        AttachmentMeta {
            filename: self.filename.clone(),
            mime_type: self.mime_type.clone(),
            inline: self.inline,
            content_id: self.content_id.clone(),
        }
    }
}

/// Attachment description that travels in the clear beside sealed bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub mime_type: String,
    pub inline: bool,
    pub content_id: Option<String>,
}

/// The part of a message that gets sealed as the body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MessageContent {
    pub subject: Option<String>,
    pub body: String,
}

/// Outgoing message as composed by the caller.
#[derive(Debug, Clone)]
pub struct Draft {
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub content: MessageContent,
    pub attachments: Vec<Attachment>,
}

impl Draft {
    pub fn new(from: EmailAddress) -> Self {
        Self {
            from,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            content: MessageContent::default(),
            attachments: Vec::new(),
        }
    }

    pub fn to(mut self, address: EmailAddress) -> Self {
        self.to.push(address);
        self
    }

    pub fn cc(mut self, address: EmailAddress) -> Self {
        self.cc.push(address);
        self
    }

    pub fn bcc(mut self, address: EmailAddress) -> Self {
        self.bcc.push(address);
        self
    }

    pub fn subject(mut self, subject: &str) -> Self {
        self.content.subject = Some(subject.to_string());
        self
    }

    pub fn body(mut self, body: &str) -> Self {
        self.content.body = body.to_string();
        self
    }

    pub fn attach(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }
}

/// Fields of a message that are readable without unsealing. Failed list
/// items carry these as partial metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub id: MessageId,
    pub owner_id: EmailAddressId,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub bcc: Vec<EmailAddress>,
    pub direction: Direction,
    pub state: MessageState,
    pub seen: bool,
    pub encryption_status: EncryptionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sort_date: DateTime<Utc>,
}

/// Raw item as held by the storage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub metadata: MessageMetadata,
    pub envelope: SealedEnvelope,
}

/// Fully materialized message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub metadata: MessageMetadata,
    pub content: MessageContent,
    pub attachments: Vec<Attachment>,
}

impl EmailMessage {
    pub fn id(&self) -> &MessageId {
        &self.metadata.id
    }
}

/// Transport acknowledgement of a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub id: MessageId,
    pub created_at: DateTime<Utc>,
    pub encryption_status: EncryptionStatus,
}
