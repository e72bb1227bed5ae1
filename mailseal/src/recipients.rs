use crate::address::{normalize, EmailAddress};
use crate::error::{MailError, Result};
use crate::keys::{KeyDirectory, KeyRef};
use crate::models::EncryptionStatus;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Recipients after the hosted-domain split, before any key lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClassifiedRecipients {
    /// Hosted-domain addresses; each must resolve to a key.
    pub candidates: BTreeSet<EmailAddress>,
    pub out_of_network: BTreeSet<EmailAddress>,
}

impl ClassifiedRecipients {
    pub fn len(&self) -> usize {
        self.candidates.len() + self.out_of_network.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Recipients of one send with in-network keys resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipientSet {
    pub in_network: BTreeMap<EmailAddress, KeyRef>,
    pub out_of_network: BTreeSet<EmailAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionDecision {
    pub status: EncryptionStatus,
    pub recipients: RecipientSet,
}

impl EncryptionDecision {
    /// Keys the content key must be wrapped for, excluding the sender.
    pub fn recipient_keys(&self) -> Vec<KeyRef> {
        match self.status {
            EncryptionStatus::Encrypted => self.recipients.in_network.values().cloned().collect(),
            EncryptionStatus::Unencrypted => Vec::new(),
        }
    }
}

pub struct RecipientClassifier {
    hosted_domains: BTreeSet<String>,
}

impl RecipientClassifier {
    pub fn new<I, S>(hosted_domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosted_domains: hosted_domains
                .into_iter()
                .map(|d| normalize(d.as_ref()))
                .collect(),
        }
    }

    pub fn is_hosted(&self, address: &EmailAddress) -> bool {
        self.hosted_domains.contains(&address.domain())
    }

    /// Split To/Cc/Bcc into hosted candidates and external addresses.
    /// Duplicates (by normalized form) collapse to the first occurrence.
    pub fn classify(
        &self,
        to: &[EmailAddress],
        cc: &[EmailAddress],
        bcc: &[EmailAddress],
    ) -> Result<ClassifiedRecipients> {
        let mut classified = ClassifiedRecipients::default();
        for address in to.iter().chain(cc).chain(bcc) {
            address.validate()?;
            if self.is_hosted(address) {
                classified.candidates.insert(address.clone());
            } else {
                classified.out_of_network.insert(address.clone());
            }
        }
        if classified.is_empty() {
            return Err(MailError::InvalidMessageContent(
                "message has no recipients".to_string(),
            ));
        }
        debug!(
            in_network_candidates = classified.candidates.len(),
            out_of_network = classified.out_of_network.len(),
            "Classified recipients"
        );
        Ok(classified)
    }
}

pub struct EncryptionPolicyResolver<'a> {
    directory: &'a dyn KeyDirectory,
}

impl<'a> EncryptionPolicyResolver<'a> {
    pub fn new(directory: &'a dyn KeyDirectory) -> Self {
        Self { directory }
    }

    /// Resolve every hosted candidate, then decide. Any unresolvable hosted
    /// address fails the whole send before sealing starts.
    pub async fn resolve(&self, classified: ClassifiedRecipients) -> Result<EncryptionDecision> {
        let mut recipients = RecipientSet {
            in_network: BTreeMap::new(),
            out_of_network: classified.out_of_network,
        };
        for candidate in classified.candidates {
            match self.directory.lookup(&candidate).await? {
                Some(key) => {
                    recipients.in_network.insert(candidate, key);
                }
                None => {
                    return Err(MailError::InNetworkAddressNotFound(candidate.normalized()));
                }
            }
        }

        let status = Self::decide(&recipients);
        if status == EncryptionStatus::Unencrypted && !recipients.in_network.is_empty() {
            info!(
                in_network = recipients.in_network.len(),
                out_of_network = recipients.out_of_network.len(),
                "Mixed recipients, sending whole message unencrypted"
            );
        }
        Ok(EncryptionDecision { status, recipients })
    }

    /// Encrypted only when every recipient is in-network.
    pub fn decide(recipients: &RecipientSet) -> EncryptionStatus {
        if recipients.out_of_network.is_empty() && !recipients.in_network.is_empty() {
            EncryptionStatus::Encrypted
        } else {
            EncryptionStatus::Unencrypted
        }
    }
}
