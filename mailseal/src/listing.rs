use crate::config::CoreConfig;
use crate::error::{FailureCause, MailError, Result};
use crate::keys::PrivateKeyStore;
use crate::models::{EmailAddressId, EmailMessage, MessageMetadata, MessageState, StoredMessage};
use crate::sealing::ContentUnsealer;
use crate::transport::{DateField, DateRange, MailTransport, PageToken, SortOrder, StorageQuery};
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Caller-facing list query. At most one of the two date ranges may be set.
/// Without a scope the query covers every identity the caller owns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    pub scope: Option<EmailAddressId>,
    pub sort_date_range: Option<DateRange>,
    pub updated_at_range: Option<DateRange>,
    pub order: SortOrder,
    pub limit: Option<usize>,
    pub next_token: Option<PageToken>,
    pub include_deleted: bool,
}

impl ListQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scope(mut self, id: EmailAddressId) -> Self {
        self.scope = Some(id);
        self
    }

    pub fn sort_date_range(mut self, range: DateRange) -> Self {
        self.sort_date_range = Some(range);
        self
    }

    pub fn updated_at_range(mut self, range: DateRange) -> Self {
        self.updated_at_range = Some(range);
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn next_token(mut self, token: Option<PageToken>) -> Self {
        self.next_token = token;
        self
    }

    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    /// Validate and resolve defaults against the caller's `owned`
    /// identities. Nothing reaches storage unless this succeeds.
    pub fn to_storage(
        &self,
        config: &CoreConfig,
        owned: &BTreeSet<EmailAddressId>,
    ) -> Result<StorageQuery> {
        let owners = match &self.scope {
            Some(id) if owned.contains(id) => BTreeSet::from([id.clone()]),
            Some(id) => return Err(MailError::UnauthorizedAddress(id.to_string())),
            None => owned.clone(),
        };
        let (date_field, date_range) = match (self.sort_date_range, self.updated_at_range) {
            (Some(_), Some(_)) => {
                return Err(MailError::InvalidArgument(
                    "sort date and updated-at ranges are mutually exclusive".to_string(),
                ))
            }
            (Some(range), None) => (DateField::SortDate, Some(range)),
            (None, Some(range)) => (DateField::UpdatedAt, Some(range)),
            (None, None) => (DateField::SortDate, None),
        };
        if let Some(range) = &date_range {
            range.validate()?;
        }

        let limit = self.limit.unwrap_or(config.default_page_size);
        if limit == 0 {
            return Err(MailError::InvalidArgument(
                "limit must be positive".to_string(),
            ));
        }
        if limit > config.max_page_size {
            return Err(MailError::LimitExceeded {
                requested: limit,
                max: config.max_page_size,
            });
        }

        Ok(StorageQuery {
            owners,
            date_field,
            date_range,
            order: self.order,
            limit,
            next_token: self.next_token.clone(),
            include_deleted: self.include_deleted,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure<P> {
    pub id: String,
    pub cause: FailureCause,
    /// Whatever could be read without unsealing.
    pub partial: P,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListItem<T, P> {
    Success(T),
    Failure(ItemFailure<P>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPage<T, P> {
    pub items: Vec<ListItem<T, P>>,
    pub next_token: Option<PageToken>,
}

/// Page classified for exhaustive matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListOutput<T, P> {
    Success {
        items: Vec<T>,
        next_token: Option<PageToken>,
    },
    Partial {
        items: Vec<T>,
        failed: Vec<ItemFailure<P>>,
        next_token: Option<PageToken>,
    },
}

impl<T, P> ListPage<T, P> {
    pub fn successes(&self) -> impl Iterator<Item = &T> {
        self.items.iter().filter_map(|item| match item {
            ListItem::Success(value) => Some(value),
            ListItem::Failure(_) => None,
        })
    }

    pub fn failures(&self) -> impl Iterator<Item = &ItemFailure<P>> {
        self.items.iter().filter_map(|item| match item {
            ListItem::Success(_) => None,
            ListItem::Failure(failure) => Some(failure),
        })
    }

    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }

    pub fn into_output(self) -> ListOutput<T, P> {
        let mut items = Vec::new();
        let mut failed = Vec::new();
        for item in self.items {
            match item {
                ListItem::Success(value) => items.push(value),
                ListItem::Failure(failure) => failed.push(failure),
            }
        }
        if failed.is_empty() {
            ListOutput::Success {
                items,
                next_token: self.next_token,
            }
        } else {
            ListOutput::Partial {
                items,
                failed,
                next_token: self.next_token,
            }
        }
    }
}

pub type MessagePage = ListPage<EmailMessage, MessageMetadata>;
pub type MessageListOutput = ListOutput<EmailMessage, MessageMetadata>;

pub struct ListReconciler<'a> {
    config: &'a CoreConfig,
    transport: &'a dyn MailTransport,
    keys: &'a dyn PrivateKeyStore,
    owned: &'a BTreeSet<EmailAddressId>,
}

impl<'a> ListReconciler<'a> {
    pub fn new(
        config: &'a CoreConfig,
        transport: &'a dyn MailTransport,
        keys: &'a dyn PrivateKeyStore,
        owned: &'a BTreeSet<EmailAddressId>,
    ) -> Self {
        Self {
            config,
            transport,
            keys,
            owned,
        }
    }

    /// Fetch and reconcile one page.
    pub async fn page(&self, query: &ListQuery) -> Result<MessagePage> {
        let storage_query = query.to_storage(self.config, self.owned)?;
        debug!(
            owners = storage_query.owners.len(),
            limit = storage_query.limit,
            date_field = ?storage_query.date_field,
            include_deleted = storage_query.include_deleted,
            "Listing messages"
        );
        let raw = self.transport.list(&storage_query).await?;

        let mut items = Vec::with_capacity(raw.items.len());
        for stored in raw.items {
            if !storage_query.owners.contains(&stored.metadata.owner_id) {
                continue;
            }
            if !storage_query.include_deleted && stored.metadata.state == MessageState::Deleted {
                continue;
            }
            items.push(self.reconcile(stored)?);
        }
        let page = ListPage {
            items,
            next_token: raw.next_token,
        };

        let failed = page.failures().count();
        if failed > 0 {
            warn!(
                failed,
                succeeded = page.items.len() - failed,
                "Returning partial message page"
            );
        }
        Ok(page)
    }

    /// Walk every page of `query` one request at a time.
    pub async fn list_all(&self, query: &ListQuery) -> Result<MessagePage> {
        let mut query = query.clone();
        let mut items = Vec::new();
        loop {
            let page = self.page(&query).await?;
            items.extend(page.items);
            match page.next_token {
                Some(token) => query.next_token = Some(token),
                None => break,
            }
        }
        Ok(ListPage {
            items,
            next_token: None,
        })
    }

    fn reconcile(&self, stored: StoredMessage) -> Result<ListItem<EmailMessage, MessageMetadata>> {
        match ContentUnsealer::new(self.keys).unseal(&stored.envelope) {
            Ok(opened) => Ok(ListItem::Success(EmailMessage {
                metadata: stored.metadata,
                content: opened.content,
                attachments: opened.attachments,
            })),
            Err(err) if err.is_item_scoped() => {
                debug!(id = %stored.metadata.id, error = %err, "Message failed to unseal");
                Ok(ListItem::Failure(ItemFailure {
                    id: stored.metadata.id.to_string(),
                    cause: FailureCause::from(&err),
                    partial: stored.metadata,
                }))
            }
            Err(err) => Err(err),
        }
    }
}
