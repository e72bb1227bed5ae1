use crate::config::CoreConfig;
use crate::crypto::{self, ContentKey, AEAD_OVERHEAD, WRAPPED_KEY_LEN};
use crate::error::{ErrorKind, MailError, Result};
use crate::keys::{KeyId, KeyRef, PrivateKeyStore};
use crate::models::{Attachment, AttachmentMeta, EncryptionStatus, MessageContent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

const BODY_AAD: &[u8] = b"mailseal:body";

fn attachment_aad(index: usize) -> Vec<u8> {
    format!("mailseal:attachment:{index}").into_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedAttachment {
    pub meta: AttachmentMeta,
    pub data: Vec<u8>,
}

/// Message content as handed to the transport. Immutable once built.
///
/// UNENCRYPTED envelopes carry no key wraps and plaintext payloads;
/// ENCRYPTED envelopes carry one wrap per distinct recipient key, the
/// sender's included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    content_key_wraps: BTreeMap<KeyId, Vec<u8>>,
    sealed_body: Vec<u8>,
    sealed_attachments: Vec<SealedAttachment>,
    encryption_status: EncryptionStatus,
}

impl SealedEnvelope {
    pub fn content_key_wraps(&self) -> &BTreeMap<KeyId, Vec<u8>> {
        &self.content_key_wraps
    }

    pub fn sealed_body(&self) -> &[u8] {
        &self.sealed_body
    }

    pub fn sealed_attachments(&self) -> &[SealedAttachment] {
        &self.sealed_attachments
    }

    pub fn encryption_status(&self) -> EncryptionStatus {
        self.encryption_status
    }

    /// Body plus attachments plus key wraps, in bytes.
    pub fn sealed_size(&self) -> usize {
        self.sealed_body.len()
            + self
                .sealed_attachments
                .iter()
                .map(|a| a.data.len())
                .sum::<usize>()
            + self.content_key_wraps.values().map(Vec::len).sum::<usize>()
    }

    fn check_shape(&self) -> Result<()> {
        match (self.encryption_status, self.content_key_wraps.is_empty()) {
            (EncryptionStatus::Unencrypted, false) => Err(MailError::InvalidMessageContent(
                "unencrypted envelope carries key wraps".to_string(),
            )),
            (EncryptionStatus::Encrypted, true) => Err(MailError::Decryption(
                "encrypted envelope carries no key wraps".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Decrypted (or passed-through) envelope contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedEnvelope {
    pub content: MessageContent,
    pub attachments: Vec<Attachment>,
}

/// Outbound size once sealed, computed without touching key material.
pub fn projected_size(
    content_len: usize,
    attachment_lens: &[usize],
    wrap_count: usize,
    status: EncryptionStatus,
) -> usize {
    let payload = content_len + attachment_lens.iter().sum::<usize>();
    match status {
        EncryptionStatus::Unencrypted => payload,
        EncryptionStatus::Encrypted => {
            payload + AEAD_OVERHEAD * (1 + attachment_lens.len()) + WRAPPED_KEY_LEN * wrap_count
        }
    }
}

pub struct ContentSealer<'a> {
    config: &'a CoreConfig,
}

impl<'a> ContentSealer<'a> {
    pub fn new(config: &'a CoreConfig) -> Self {
        Self { config }
    }

    /// Reject attachments of blocked types before any crypto work.
    pub fn validate_attachments(&self, attachments: &[Attachment]) -> Result<()> {
        for attachment in attachments {
            let filename = attachment.filename.trim();
            if filename.is_empty() {
                return Err(MailError::InvalidMessageContent(
                    "attachment without a filename".to_string(),
                ));
            }
            if let Some((_, ext)) = filename.rsplit_once('.') {
                let ext = ext.to_lowercase();
                if self
                    .config
                    .blocked_attachment_extensions
                    .iter()
                    .any(|blocked| blocked.eq_ignore_ascii_case(&ext))
                {
                    return Err(MailError::InvalidMessageContent(format!(
                        "attachment type .{ext} is not allowed: {filename}"
                    )));
                }
            }
            let mime = attachment.mime_type.trim();
            if self
                .config
                .blocked_attachment_mime_types
                .iter()
                .any(|blocked| blocked.eq_ignore_ascii_case(mime))
            {
                return Err(MailError::InvalidMessageContent(format!(
                    "attachment MIME type {mime} is not allowed: {filename}"
                )));
            }
            if attachment.inline && attachment.content_id.is_none() {
                return Err(MailError::InvalidMessageContent(format!(
                    "inline attachment {filename} has no content id"
                )));
            }
        }
        Ok(())
    }

    /// Fail with `MessageSizeLimitExceeded` if the sealed message would be
    /// over the configured ceiling.
    pub fn check_size(
        &self,
        content: &MessageContent,
        attachments: &[Attachment],
        wrap_count: usize,
        status: EncryptionStatus,
    ) -> Result<usize> {
        let content_len = serde_json::to_vec(content)?.len();
        let lens: Vec<usize> = attachments.iter().map(|a| a.data.len()).collect();
        let size = projected_size(content_len, &lens, wrap_count, status);
        if size > self.config.max_outbound_message_bytes {
            return Err(MailError::MessageSizeLimitExceeded {
                size,
                max: self.config.max_outbound_message_bytes,
            });
        }
        Ok(size)
    }

    /// Envelope for an UNENCRYPTED send.
    pub fn plaintext(
        &self,
        content: &MessageContent,
        attachments: &[Attachment],
    ) -> Result<SealedEnvelope> {
        Ok(SealedEnvelope {
            content_key_wraps: BTreeMap::new(),
            sealed_body: serde_json::to_vec(content)?,
            sealed_attachments: attachments
                .iter()
                .map(|a| SealedAttachment {
                    meta: a.metadata(),
                    data: a.data.clone(),
                })
                .collect(),
            encryption_status: EncryptionStatus::Unencrypted,
        })
    }

    /// Seal for `recipients` (the sender's own key included by the caller).
    /// Keys sharing an id are wrapped once.
    pub fn seal(
        &self,
        content: &MessageContent,
        attachments: &[Attachment],
        recipients: &[KeyRef],
    ) -> Result<SealedEnvelope> {
        if recipients.is_empty() {
            return Err(MailError::InvalidArgument(
                "cannot seal without recipient keys".to_string(),
            ));
        }
        let content_key = ContentKey::generate();

        let mut content_key_wraps = BTreeMap::new();
        for key in recipients {
            if content_key_wraps.contains_key(&key.key_id) {
                continue;
            }
            let wrapped = crypto::wrap_content_key(&key.public_key, &content_key)?;
            content_key_wraps.insert(key.key_id.clone(), wrapped);
        }

        let body = serde_json::to_vec(content)?;
        let sealed_body = crypto::seal(&content_key, &body, BODY_AAD)?;
        let sealed_attachments = attachments
            .iter()
            .enumerate()
            .map(|(i, a)| -> Result<SealedAttachment> {
                Ok(SealedAttachment {
                    meta: a.metadata(),
                    data: crypto::seal(&content_key, &a.data, &attachment_aad(i))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(
            wraps = content_key_wraps.len(),
            attachments = sealed_attachments.len(),
            "Sealed message content"
        );
        Ok(SealedEnvelope {
            content_key_wraps,
            sealed_body,
            sealed_attachments,
            encryption_status: EncryptionStatus::Encrypted,
        })
    }
}

pub struct ContentUnsealer<'a> {
    keys: &'a dyn PrivateKeyStore,
}

impl<'a> ContentUnsealer<'a> {
    pub fn new(keys: &'a dyn PrivateKeyStore) -> Self {
        Self { keys }
    }

    /// Open one envelope. Every failure describes this envelope only.
    pub fn unseal(&self, envelope: &SealedEnvelope) -> Result<OpenedEnvelope> {
        envelope.check_shape()?;
        match envelope.encryption_status {
            EncryptionStatus::Unencrypted => Self::passthrough(envelope),
            EncryptionStatus::Encrypted => {
                let content_key = self.find_content_key(envelope)?;
                Self::decrypt(envelope, &content_key)
            }
        }
    }

    fn find_content_key(&self, envelope: &SealedEnvelope) -> Result<ContentKey> {
        for (key_id, wrapped) in &envelope.content_key_wraps {
            match self.keys.unwrap_key(key_id, wrapped) {
                Ok(key) => return Ok(key),
                Err(err) if err.kind() == ErrorKind::KeyNotFound => continue,
                Err(err) => return Err(err),
            }
        }
        Err(MailError::Decryption(
            "no content key wrap matches local key material".to_string(),
        ))
    }

    fn passthrough(envelope: &SealedEnvelope) -> Result<OpenedEnvelope> {
        let content: MessageContent = serde_json::from_slice(&envelope.sealed_body)
            .map_err(|e| MailError::InvalidMessageContent(format!("unreadable body: {e}")))?;
        Ok(OpenedEnvelope {
            content,
            attachments: envelope
                .sealed_attachments
                .iter()
                .map(|a| to_attachment(&a.meta, a.data.clone()))
                .collect(),
        })
    }

    fn decrypt(envelope: &SealedEnvelope, key: &ContentKey) -> Result<OpenedEnvelope> {
        let decryption = |what: &str| MailError::Decryption(format!("{what} failed authentication"));
        let body = crypto::open(key, &envelope.sealed_body, BODY_AAD)
            .map_err(|_| decryption("body"))?;
        let content: MessageContent =
            serde_json::from_slice(&body).map_err(|_| decryption("body"))?;
        let attachments = envelope
            .sealed_attachments
            .iter()
            .enumerate()
            .map(|(i, a)| {
                crypto::open(key, &a.data, &attachment_aad(i))
                    .map(|data| to_attachment(&a.meta, data))
                    .map_err(|_| decryption(&format!("attachment {i}")))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(OpenedEnvelope {
            content,
            attachments,
        })
    }
}

fn to_attachment(meta: &AttachmentMeta, data: Vec<u8>) -> Attachment {
    Attachment {
        filename: meta.filename.clone(),
        mime_type: meta.mime_type.clone(),
        inline: meta.inline,
        content_id: meta.content_id.clone(),
        data,
    }
}
