use crate::address::EmailAddress;
use crate::batch::{BatchOperationEngine, BatchResult, TargetOperation};
use crate::blocklist::{BlockAction, BlockScopeLevel, BlockedAddressEntry, BlocklistPolicy};
use crate::config::CoreConfig;
use crate::error::{MailError, NotFoundKind, Result};
use crate::keys::{KeyDirectory, KeyId, PrivateKeyStore};
use crate::listing::{ListQuery, ListReconciler, MessagePage};
use crate::models::{
    AccountId, Draft, EmailAddressId, EmailMessage, EncryptionStatus, MessageId, ProvisionedAddress,
    SendReceipt,
};
use crate::recipients::{EncryptionPolicyResolver, RecipientClassifier};
use crate::sealing::{ContentSealer, ContentUnsealer};
use crate::storage::SqliteMailStore;
use crate::transport::{BlocklistStore, MailTransport, OutboundMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-message batch actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOperation {
    Delete,
    MarkSeen,
    MarkUnseen,
}

struct MessageBatch<'a> {
    transport: &'a dyn MailTransport,
    owned: &'a BTreeSet<EmailAddressId>,
    operation: MessageOperation,
}

#[async_trait]
impl TargetOperation<MessageId> for MessageBatch<'_> {
    fn name(&self) -> &'static str {
        match self.operation {
            MessageOperation::Delete => "delete_messages",
            MessageOperation::MarkSeen => "mark_seen",
            MessageOperation::MarkUnseen => "mark_unseen",
        }
    }

    /// Messages of other accounts are reported as absent.
    async fn apply_one(&self, target: &MessageId) -> Result<()> {
        match self.transport.get(target).await? {
            Some(stored) if self.owned.contains(&stored.metadata.owner_id) => {}
            _ => return Err(MailError::not_found(NotFoundKind::Message, target.as_str())),
        }
        match self.operation {
            MessageOperation::Delete => self.transport.delete(target).await,
            MessageOperation::MarkSeen => self.transport.set_seen(target, true).await,
            MessageOperation::MarkUnseen => self.transport.set_seen(target, false).await,
        }
    }
}

pub struct EmailClient {
    config: CoreConfig,
    account: AccountId,
    classifier: RecipientClassifier,
    engine: BatchOperationEngine,
    transport: Arc<dyn MailTransport>,
    blocklist: Arc<dyn BlocklistStore>,
    directory: Arc<dyn KeyDirectory>,
    keys: Arc<dyn PrivateKeyStore>,
    identities: RwLock<BTreeMap<EmailAddress, ProvisionedAddress>>,
    /// Every id ever provisioned here, deprovisioned ones included.
    owned_ids: RwLock<BTreeSet<EmailAddressId>>,
}

impl EmailClient {
    pub fn new(
        config: CoreConfig,
        account: AccountId,
        transport: Arc<dyn MailTransport>,
        blocklist: Arc<dyn BlocklistStore>,
        directory: Arc<dyn KeyDirectory>,
        keys: Arc<dyn PrivateKeyStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            classifier: RecipientClassifier::new(&config.hosted_domains),
            engine: BatchOperationEngine::new(config.max_batch_size),
            config,
            account,
            transport,
            blocklist,
            directory,
            keys,
            identities: RwLock::new(BTreeMap::new()),
            owned_ids: RwLock::new(BTreeSet::new()),
        })
    }

    /// Client backed by one SQLite store for every collaborator.
    pub fn with_store(
        config: CoreConfig,
        account: AccountId,
        store: Arc<SqliteMailStore>,
        keys: Arc<dyn PrivateKeyStore>,
    ) -> Result<Self> {
        Self::new(config, account, store.clone(), store.clone(), store, keys)
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn account(&self) -> &AccountId {
        &self.account
    }

    pub fn identities(&self) -> Vec<ProvisionedAddress> {
        self.identities.read().values().cloned().collect()
    }

    /// Generate a key pair for `address` and register it with the backend.
    pub async fn provision_address(&self, address: &EmailAddress) -> Result<ProvisionedAddress> {
        address.validate()?;
        if !self.classifier.is_hosted(address) {
            return Err(MailError::InvalidArgument(format!(
                "{} is not on a hosted domain",
                address.normalized()
            )));
        }

        let key_id = KeyId::generate();
        let key = self.keys.generate_key_pair(&key_id)?;
        let record = match self.transport.provision(address, &key).await {
            Ok(record) => record,
            Err(err) => {
                if let Err(cleanup) = self.keys.delete_key(&key_id) {
                    warn!(key_id = %key_id, error = %cleanup, "Failed to discard unused key");
                }
                return Err(err);
            }
        };

        self.identities
            .write()
            .insert(record.address.clone(), record.clone());
        self.owned_ids.write().insert(record.id.clone());
        info!(account = %self.account, id = %record.id, "Address provisioned");
        Ok(record)
    }

    /// Key material is kept so earlier mail stays readable.
    pub async fn deprovision_address(&self, id: &EmailAddressId) -> Result<ProvisionedAddress> {
        if !self.owns_id(id) {
            return Err(MailError::UnauthorizedAddress(id.to_string()));
        }
        let record = self.transport.deprovision(id).await?;
        self.identities.write().retain(|_, owned| owned.id != *id);
        info!(id = %id, "Address deprovisioned");
        Ok(record)
    }

    fn owned_identity(&self, address: &EmailAddress) -> Result<ProvisionedAddress> {
        self.identities
            .read()
            .get(address)
            .cloned()
            .ok_or_else(|| MailError::UnauthorizedAddress(address.normalized()))
    }

    fn owns_id(&self, id: &EmailAddressId) -> bool {
        self.owned_ids.read().contains(id)
    }

    fn owned_ids(&self) -> BTreeSet<EmailAddressId> {
        self.owned_ids.read().clone()
    }

    pub async fn send(&self, draft: &Draft) -> Result<SendReceipt> {
        self.dispatch(draft, None).await
    }

    pub async fn schedule_send(
        &self,
        draft: &Draft,
        send_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<SendReceipt> {
        if send_at <= now {
            return Err(MailError::InvalidArgument(format!(
                "scheduled time {send_at} is not in the future"
            )));
        }
        self.dispatch(draft, Some(send_at)).await
    }

    async fn dispatch(&self, draft: &Draft, send_at: Option<DateTime<Utc>>) -> Result<SendReceipt> {
        let sender = self.owned_identity(&draft.from)?;
        let classified = self
            .classifier
            .classify(&draft.to, &draft.cc, &draft.bcc)?;
        let sealer = ContentSealer::new(&self.config);
        sealer.validate_attachments(&draft.attachments)?;

        let decision = EncryptionPolicyResolver::new(self.directory.as_ref())
            .resolve(classified)
            .await?;

        let envelope = match decision.status {
            EncryptionStatus::Encrypted => {
                let mut keys = decision.recipient_keys();
                keys.push(self.keys.public_key_ref(&sender.key_id)?);
                let wraps = keys.iter().map(|k| &k.key_id).collect::<BTreeSet<_>>().len();
                sealer.check_size(&draft.content, &draft.attachments, wraps, decision.status)?;
                sealer.seal(&draft.content, &draft.attachments, &keys)?
            }
            EncryptionStatus::Unencrypted => {
                sealer.check_size(&draft.content, &draft.attachments, 0, decision.status)?;
                sealer.plaintext(&draft.content, &draft.attachments)?
            }
        };

        let receipt = self
            .transport
            .send(OutboundMessage {
                sender_id: sender.id,
                from: draft.from.clone(),
                to: draft.to.clone(),
                cc: draft.cc.clone(),
                bcc: draft.bcc.clone(),
                envelope,
                send_at,
            })
            .await?;
        info!(
            id = %receipt.id,
            encryption_status = ?receipt.encryption_status,
            scheduled = send_at.is_some(),
            "Message sent"
        );
        Ok(receipt)
    }

    /// Without a scope the page covers every identity of this account.
    pub async fn page_messages(&self, query: &ListQuery) -> Result<MessagePage> {
        let owned = self.owned_ids();
        self.reconciler(&owned).page(query).await
    }

    pub async fn list_all_messages(&self, query: &ListQuery) -> Result<MessagePage> {
        let owned = self.owned_ids();
        self.reconciler(&owned).list_all(query).await
    }

    fn reconciler<'a>(&'a self, owned: &'a BTreeSet<EmailAddressId>) -> ListReconciler<'a> {
        ListReconciler::new(&self.config, self.transport.as_ref(), self.keys.as_ref(), owned)
    }

    /// Unlike listing, a message that cannot be unsealed fails the call.
    /// Mail of another account is reported as absent.
    pub async fn get_message(&self, id: &MessageId) -> Result<EmailMessage> {
        let stored = self
            .transport
            .get(id)
            .await?
            .filter(|stored| self.owns_id(&stored.metadata.owner_id))
            .ok_or_else(|| MailError::not_found(NotFoundKind::Message, id.as_str()))?;
        let opened = ContentUnsealer::new(self.keys.as_ref()).unseal(&stored.envelope)?;
        Ok(EmailMessage {
            metadata: stored.metadata,
            content: opened.content,
            attachments: opened.attachments,
        })
    }

    pub async fn apply_batch(
        &self,
        operation: MessageOperation,
        ids: &[MessageId],
    ) -> Result<BatchResult<MessageId>> {
        let owned = self.owned_ids();
        let batch = MessageBatch {
            transport: self.transport.as_ref(),
            owned: &owned,
            operation,
        };
        self.engine.apply(&batch, ids).await
    }

    pub async fn delete_messages(&self, ids: &[MessageId]) -> Result<BatchResult<MessageId>> {
        self.apply_batch(MessageOperation::Delete, ids).await
    }

    fn blocklist_policy(&self) -> BlocklistPolicy<'_> {
        BlocklistPolicy::new(self.blocklist.as_ref(), &self.engine, &self.account)
    }

    /// `owner_scope` limits the rules to one owned identity; `None` applies
    /// them account-wide.
    pub async fn block_addresses(
        &self,
        addresses: &[EmailAddress],
        scope_level: BlockScopeLevel,
        action: BlockAction,
        owner_scope: Option<EmailAddressId>,
    ) -> Result<BatchResult<EmailAddress>> {
        if let Some(owner) = &owner_scope {
            if !self.owns_id(owner) {
                return Err(MailError::UnauthorizedAddress(owner.to_string()));
            }
        }
        self.blocklist_policy()
            .block(addresses, scope_level, action, owner_scope)
            .await
    }

    /// Removes the rules at `scope_level` only.
    pub async fn unblock_addresses(
        &self,
        addresses: &[EmailAddress],
        scope_level: BlockScopeLevel,
    ) -> Result<BatchResult<EmailAddress>> {
        self.blocklist_policy()
            .unblock(addresses, scope_level)
            .await
    }

    pub async fn unblock_hashed(&self, hashed_values: &[String]) -> Result<BatchResult<String>> {
        self.blocklist_policy().unblock_hashed(hashed_values).await
    }

    pub async fn blocked_addresses(&self) -> Result<Vec<BlockedAddressEntry>> {
        self.blocklist_policy().entries().await
    }

    pub async fn is_blocked(
        &self,
        sender: &EmailAddress,
        receiving_identity: &EmailAddressId,
    ) -> Result<Option<BlockAction>> {
        self.blocklist_policy()
            .check(sender, receiving_identity)
            .await
    }

    pub fn export_keys(&self) -> Result<Vec<u8>> {
        self.keys.export_archive()
    }

    pub fn import_keys(&self, archive: &[u8]) -> Result<()> {
        self.keys.import_archive(archive)?;
        debug!("Imported key archive");
        Ok(())
    }

    /// Drop all local key material. Mail sealed to the old keys can no
    /// longer be opened.
    pub fn reset_keys(&self) -> Result<()> {
        self.keys.reset()?;
        warn!("Local key material reset");
        Ok(())
    }
}
