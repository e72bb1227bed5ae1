use crate::address::{normalize, EmailAddress};
use crate::batch::{BatchOperationEngine, BatchResult, TargetOperation};
use crate::crypto::hash_blocked_value;
use crate::error::{MailError, NotFoundKind, Result};
use crate::models::{AccountId, EmailAddressId};
use crate::transport::BlocklistStore;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockScopeLevel {
    Address,
    Domain,
}

impl BlockScopeLevel {
    /// The normalized value a rule at this level is keyed on.
    pub fn value_of(&self, address: &EmailAddress) -> String {
        match self {
            BlockScopeLevel::Address => address.normalized(),
            BlockScopeLevel::Domain => address.domain(),
        }
    }

    pub fn hash_of(&self, address: &EmailAddress) -> String {
        hash_blocked_value(&self.value_of(address))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockAction {
    /// Drop the message.
    Block,
    /// Deliver to spam.
    Spam,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedAddressEntry {
    pub hashed_value: String,
    pub original_value_display: String,
    pub scope_level: BlockScopeLevel,
    pub action: BlockAction,
    pub owner_scope: Option<EmailAddressId>,
}

impl BlockedAddressEntry {
    pub fn new(
        address: &EmailAddress,
        scope_level: BlockScopeLevel,
        action: BlockAction,
        owner_scope: Option<EmailAddressId>,
    ) -> Self {
        let original_value_display = match scope_level {
            BlockScopeLevel::Address => address.address().to_string(),
            BlockScopeLevel::Domain => address.domain(),
        };
        Self {
            hashed_value: scope_level.hash_of(address),
            original_value_display,
            scope_level,
            action,
            owner_scope,
        }
    }

    /// Does this rule cover `sender` arriving at `receiving_identity`?
    pub fn matches(&self, sender: &EmailAddress, receiving_identity: &EmailAddressId) -> bool {
        if let Some(owner) = &self.owner_scope {
            if owner != receiving_identity {
                return false;
            }
        }
        self.hashed_value == self.scope_level.hash_of(sender)
    }
}

/// Pure delivery predicate. A hard block wins over a spam rule.
pub fn is_blocked(
    sender: &EmailAddress,
    receiving_identity: &EmailAddressId,
    entries: &[BlockedAddressEntry],
) -> Option<BlockAction> {
    let mut verdict = None;
    for entry in entries.iter().filter(|e| e.matches(sender, receiving_identity)) {
        match entry.action {
            BlockAction::Block => return Some(BlockAction::Block),
            BlockAction::Spam => verdict = Some(BlockAction::Spam),
        }
    }
    verdict
}

struct BlockOperation<'a> {
    store: &'a dyn BlocklistStore,
    account: &'a AccountId,
    scope_level: BlockScopeLevel,
    action: BlockAction,
    owner_scope: Option<EmailAddressId>,
}

#[async_trait]
impl TargetOperation<EmailAddress> for BlockOperation<'_> {
    fn name(&self) -> &'static str {
        "block"
    }

    async fn apply_one(&self, target: &EmailAddress) -> Result<()> {
        let entry =
            BlockedAddressEntry::new(target, self.scope_level, self.action, self.owner_scope.clone());
        self.store.put_blocked(self.account, entry).await
    }
}

struct UnblockOperation<'a> {
    store: &'a dyn BlocklistStore,
    account: &'a AccountId,
    scope_level: BlockScopeLevel,
}

#[async_trait]
impl TargetOperation<EmailAddress> for UnblockOperation<'_> {
    fn name(&self) -> &'static str {
        "unblock"
    }

    /// Removes only the rule at `scope_level`; a domain rule outlives the
    /// unblock of one of its addresses.
    async fn apply_one(&self, target: &EmailAddress) -> Result<()> {
        let hashed = self.scope_level.hash_of(target);
        if self.store.remove_blocked(self.account, &hashed).await? == 0 {
            return Err(MailError::not_found(
                NotFoundKind::BlockedAddress,
                self.scope_level.value_of(target),
            ));
        }
        Ok(())
    }
}

struct UnblockHashedOperation<'a> {
    store: &'a dyn BlocklistStore,
    account: &'a AccountId,
}

#[async_trait]
impl TargetOperation<String> for UnblockHashedOperation<'_> {
    fn name(&self) -> &'static str {
        "unblock_hashed"
    }

    async fn apply_one(&self, target: &String) -> Result<()> {
        if self.store.remove_blocked(self.account, target).await? == 0 {
            return Err(MailError::not_found(
                NotFoundKind::BlockedAddress,
                target.as_str(),
            ));
        }
        Ok(())
    }
}

/// Blocklist of one account. Rules are stored under the account and never
/// seen by another.
pub struct BlocklistPolicy<'a> {
    store: &'a dyn BlocklistStore,
    engine: &'a BatchOperationEngine,
    account: &'a AccountId,
}

impl<'a> BlocklistPolicy<'a> {
    pub fn new(
        store: &'a dyn BlocklistStore,
        engine: &'a BatchOperationEngine,
        account: &'a AccountId,
    ) -> Self {
        Self {
            store,
            engine,
            account,
        }
    }

    /// Block each address. Re-blocking replaces the rule's action.
    pub async fn block(
        &self,
        addresses: &[EmailAddress],
        scope_level: BlockScopeLevel,
        action: BlockAction,
        owner_scope: Option<EmailAddressId>,
    ) -> Result<BatchResult<EmailAddress>> {
        let operation = BlockOperation {
            store: self.store,
            account: self.account,
            scope_level,
            action,
            owner_scope,
        };
        self.engine.apply(&operation, addresses).await
    }

    pub async fn unblock(
        &self,
        addresses: &[EmailAddress],
        scope_level: BlockScopeLevel,
    ) -> Result<BatchResult<EmailAddress>> {
        let operation = UnblockOperation {
            store: self.store,
            account: self.account,
            scope_level,
        };
        self.engine.apply(&operation, addresses).await
    }

    /// Unblock by stored hash, for rules whose address is not at hand.
    pub async fn unblock_hashed(&self, hashed_values: &[String]) -> Result<BatchResult<String>> {
        let operation = UnblockHashedOperation {
            store: self.store,
            account: self.account,
        };
        self.engine.apply(&operation, hashed_values).await
    }

    pub async fn entries(&self) -> Result<Vec<BlockedAddressEntry>> {
        self.store.blocked(self.account).await
    }

    pub async fn check(
        &self,
        sender: &EmailAddress,
        receiving_identity: &EmailAddressId,
    ) -> Result<Option<BlockAction>> {
        let entries = self.store.blocked(self.account).await?;
        let verdict = is_blocked(sender, receiving_identity, &entries);
        debug!(
            account = %self.account,
            sender = %normalize(sender.address()),
            verdict = ?verdict,
            "Checked blocklist"
        );
        Ok(verdict)
    }
}
