use crate::address::EmailAddress;
use crate::blocklist::BlockedAddressEntry;
use crate::error::{MailError, NotFoundKind, Result};
use crate::keys::{KeyDirectory, KeyId, KeyRef};
use crate::models::{
    AccountId, Direction, EmailAddressId, MessageId, MessageMetadata, MessageState, ProvisionedAddress,
    SendReceipt, StoredMessage,
};
use crate::transport::{
    BlocklistStore, DateField, MailTransport, OutboundMessage, PageToken, SortOrder,
    StorageQuery, StoragePage,
};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::BTreeSet;
use tokio::sync::Mutex;
use tracing::{debug, info};

const ACTIVE: &str = "ACTIVE";
const DEPROVISIONED: &str = "DEPROVISIONED";

pub struct SqliteMailStore {
    conn: Mutex<Connection>,
}

impl SqliteMailStore {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS addresses (
                id TEXT PRIMARY KEY,
                normalized TEXT NOT NULL UNIQUE,
                key_id TEXT NOT NULL,
                public_key BLOB NOT NULL,
                state TEXT NOT NULL,
                data TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                state TEXT NOT NULL,
                sort_date INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                data TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS blocked_addresses (
                account TEXT NOT NULL,
                hashed_value TEXT NOT NULL,
                owner_scope TEXT NOT NULL DEFAULT '',
                data TEXT NOT NULL,
                PRIMARY KEY (account, hashed_value, owner_scope)
            )",
            [],
        )?;

        Ok(SqliteMailStore {
            conn: Mutex::new(conn),
        })
    }

    /// Inbound entry point: store a message exactly as given.
    pub async fn deliver(&self, message: &StoredMessage) -> Result<()> {
        let conn = self.conn.lock().await;
        Self::put_message(&conn, message)
    }

    fn put_message(conn: &Connection, message: &StoredMessage) -> Result<()> {
        let data = serde_json::to_string(message)?;
        let meta = &message.metadata;
        conn.execute(
            "INSERT OR REPLACE INTO messages (id, owner_id, state, sort_date, updated_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                meta.id.as_str(),
                meta.owner_id.as_str(),
                meta.state.as_str(),
                meta.sort_date.timestamp_millis(),
                meta.updated_at.timestamp_millis(),
                data
            ],
        )?;
        Ok(())
    }

    fn load_message(conn: &Connection, id: &MessageId) -> Result<Option<StoredMessage>> {
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM messages WHERE id = ?1",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        data.map(|d| serde_json::from_str(&d).map_err(MailError::from))
            .transpose()
    }

    fn active_address_id(conn: &Connection, normalized: &str) -> Result<Option<EmailAddressId>> {
        let id: Option<String> = conn
            .query_row(
                "SELECT id FROM addresses WHERE normalized = ?1 AND state = ?2",
                params![normalized, ACTIVE],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.map(EmailAddressId))
    }

    fn load_address(conn: &Connection, id: &EmailAddressId) -> Result<Option<(ProvisionedAddress, String)>> {
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT data, state FROM addresses WHERE id = ?1",
                [id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        row.map(|(data, state)| -> Result<(ProvisionedAddress, String)> {
            Ok((serde_json::from_str(&data)?, state))
        })
        .transpose()
    }

    /// Apply `update` to a live message; deleted or absent messages are
    /// `NotFound`.
    async fn update_live<F>(&self, id: &MessageId, update: F) -> Result<()>
    where
        F: FnOnce(&mut MessageMetadata) + Send,
    {
        let conn = self.conn.lock().await;
        let mut message = match Self::load_message(&conn, id)? {
            Some(m) if m.metadata.state != MessageState::Deleted => m,
            _ => return Err(MailError::not_found(NotFoundKind::Message, id.as_str())),
        };
        update(&mut message.metadata);
        message.metadata.updated_at = Utc::now();
        Self::put_message(&conn, &message)
    }
}

#[async_trait]
impl KeyDirectory for SqliteMailStore {
    async fn lookup(&self, address: &EmailAddress) -> Result<Option<KeyRef>> {
        let conn = self.conn.lock().await;
        let row: Option<(String, Vec<u8>)> = conn
            .query_row(
                "SELECT key_id, public_key FROM addresses WHERE normalized = ?1 AND state = ?2",
                params![address.normalized(), ACTIVE],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        Ok(row.map(|(key_id, public_key)| KeyRef {
            key_id: KeyId(key_id),
            public_key,
        }))
    }
}

#[async_trait]
impl MailTransport for SqliteMailStore {
    async fn provision(
        &self,
        address: &EmailAddress,
        key: &KeyRef,
    ) -> Result<ProvisionedAddress> {
        let conn = self.conn.lock().await;
        let normalized = address.normalized();
        let existing: Option<String> = conn
            .query_row(
                "SELECT state FROM addresses WHERE normalized = ?1",
                [normalized.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match existing.as_deref() {
            Some(ACTIVE) => return Err(MailError::AlreadyExists(normalized)),
            Some(_) => {
                return Err(MailError::Unavailable(format!(
                    "{normalized} was deprovisioned and cannot be reused"
                )))
            }
            None => {}
        }

        let record = ProvisionedAddress {
            id: EmailAddressId::generate(),
            address: address.clone(),
            key_id: key.key_id.clone(),
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO addresses (id, normalized, key_id, public_key, state, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id.as_str(),
                normalized,
                key.key_id.0,
                key.public_key,
                ACTIVE,
                serde_json::to_string(&record)?
            ],
        )?;
        info!(id = %record.id, "Provisioned address");
        Ok(record)
    }

    async fn deprovision(&self, id: &EmailAddressId) -> Result<ProvisionedAddress> {
        let conn = self.conn.lock().await;
        match Self::load_address(&conn, id)? {
            Some((record, state)) if state == ACTIVE => {
                conn.execute(
                    "UPDATE addresses SET state = ?1 WHERE id = ?2",
                    params![DEPROVISIONED, id.as_str()],
                )?;
                info!(id = %id, "Deprovisioned address");
                Ok(record)
            }
            _ => Err(MailError::not_found(NotFoundKind::Address, id.as_str())),
        }
    }

    async fn send(&self, message: OutboundMessage) -> Result<SendReceipt> {
        let mut conn = self.conn.lock().await;
        match Self::load_address(&conn, &message.sender_id)? {
            Some((_, state)) if state == ACTIVE => {}
            _ => {
                return Err(MailError::not_found(
                    NotFoundKind::Address,
                    message.sender_id.as_str(),
                ))
            }
        }

        let now = Utc::now();
        let scheduled = message.send_at.filter(|at| *at > now);
        let encryption_status = message.envelope.encryption_status();
        let outbound = StoredMessage {
            metadata: MessageMetadata {
                id: MessageId::generate(),
                owner_id: message.sender_id.clone(),
                from: message.from.clone(),
                to: message.to.clone(),
                cc: message.cc.clone(),
                bcc: message.bcc.clone(),
                direction: Direction::Outbound,
                state: if scheduled.is_some() {
                    MessageState::Queued
                } else {
                    MessageState::Sent
                },
                seen: true,
                encryption_status,
                created_at: now,
                updated_at: now,
                sort_date: scheduled.unwrap_or(now),
            },
            envelope: message.envelope.clone(),
        };

        let tx = conn.transaction()?;
        Self::put_message(&tx, &outbound)?;

        if scheduled.is_none() {
            let mut delivered = BTreeSet::new();
            for recipient in message.to.iter().chain(&message.cc).chain(&message.bcc) {
                if !delivered.insert(recipient.normalized()) {
                    continue;
                }
                let Some(owner_id) = Self::active_address_id(&tx, &recipient.normalized())? else {
                    continue;
                };
                let mut inbound = outbound.clone();
                inbound.metadata.id = MessageId::generate();
                inbound.metadata.owner_id = owner_id;
                inbound.metadata.direction = Direction::Inbound;
                inbound.metadata.state = MessageState::Received;
                inbound.metadata.seen = false;
                inbound.metadata.bcc.clear();
                Self::put_message(&tx, &inbound)?;
            }
            debug!(local_deliveries = delivered.len(), "Delivered in-service copies");
        }
        tx.commit()?;

        Ok(SendReceipt {
            id: outbound.metadata.id,
            created_at: now,
            encryption_status,
        })
    }

    async fn list(&self, query: &StorageQuery) -> Result<StoragePage> {
        let offset: usize = match &query.next_token {
            Some(PageToken(token)) => token.parse().map_err(|_| {
                MailError::InvalidArgument(format!("malformed page token: {token}"))
            })?,
            None => 0,
        };
        if query.owners.is_empty() {
            return Ok(StoragePage {
                items: Vec::new(),
                next_token: None,
            });
        }
        let column = match query.date_field {
            DateField::SortDate => "sort_date",
            DateField::UpdatedAt => "updated_at",
        };
        let direction = match query.order {
            SortOrder::Ascending => "ASC",
            SortOrder::Descending => "DESC",
        };
        let owner_slots = (0..query.owners.len())
            .map(|i| format!("?{}", i + 6))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT data FROM messages
             WHERE owner_id IN ({owner_slots})
               AND (?1 OR state != 'DELETED')
               AND (?2 IS NULL OR {column} >= ?2)
               AND (?3 IS NULL OR {column} <= ?3)
             ORDER BY {column} {direction}, id {direction}
             LIMIT ?4 OFFSET ?5"
        );

        let mut values = vec![
            Value::Integer(query.include_deleted as i64),
            query
                .date_range
                .map_or(Value::Null, |r| Value::Integer(r.start.timestamp_millis())),
            query
                .date_range
                .map_or(Value::Null, |r| Value::Integer(r.end.timestamp_millis())),
            Value::Integer((query.limit + 1) as i64),
            Value::Integer(offset as i64),
        ];
        values.extend(query.owners.iter().map(|o| Value::Text(o.0.clone())));

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| row.get::<_, String>(0))?;
        let mut items = rows
            .map(|data| -> Result<StoredMessage> { Ok(serde_json::from_str(&data?)?) })
            .collect::<Result<Vec<_>>>()?;

        let next_token = if items.len() > query.limit {
            items.truncate(query.limit);
            Some(PageToken((offset + query.limit).to_string()))
        } else {
            None
        };
        Ok(StoragePage { items, next_token })
    }

    async fn get(&self, id: &MessageId) -> Result<Option<StoredMessage>> {
        let conn = self.conn.lock().await;
        Self::load_message(&conn, id)
    }

    async fn delete(&self, id: &MessageId) -> Result<()> {
        self.update_live(id, |meta| meta.state = MessageState::Deleted)
            .await
    }

    async fn set_seen(&self, id: &MessageId, seen: bool) -> Result<()> {
        self.update_live(id, |meta| meta.seen = seen).await
    }
}

#[async_trait]
impl BlocklistStore for SqliteMailStore {
    async fn put_blocked(&self, account: &AccountId, entry: BlockedAddressEntry) -> Result<()> {
        let conn = self.conn.lock().await;
        let owner = entry
            .owner_scope
            .as_ref()
            .map(|o| o.0.clone())
            .unwrap_or_default();
        conn.execute(
            "INSERT OR REPLACE INTO blocked_addresses (account, hashed_value, owner_scope, data)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                account.as_str(),
                entry.hashed_value,
                owner,
                serde_json::to_string(&entry)?
            ],
        )?;
        Ok(())
    }

    async fn remove_blocked(&self, account: &AccountId, hashed_value: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        Ok(conn.execute(
            "DELETE FROM blocked_addresses WHERE account = ?1 AND hashed_value = ?2",
            params![account.as_str(), hashed_value],
        )?)
    }

    async fn blocked(&self, account: &AccountId) -> Result<Vec<BlockedAddressEntry>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT data FROM blocked_addresses WHERE account = ?1 ORDER BY hashed_value",
        )?;
        let rows = stmt.query_map([account.as_str()], |row| row.get::<_, String>(0))?;
        let entries = rows
            .map(|data| -> Result<BlockedAddressEntry> { Ok(serde_json::from_str(&data?)?) })
            .collect::<Result<Vec<_>>>()?;
        Ok(entries)
    }
}
