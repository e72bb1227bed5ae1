use mailseal::batch::BatchStatus;
use mailseal::blocklist::{BlockAction, BlockScopeLevel};
use mailseal::crypto::hash_blocked_value;
use mailseal::keys::LocalKeyStore;
use mailseal::listing::ListQuery;
use mailseal::models::{AccountId, Attachment, Draft};
use mailseal::storage::SqliteMailStore;
use mailseal::{CoreConfig, EmailAddress, EmailClient, ErrorKind};
use std::sync::Arc;

fn addr(s: &str) -> EmailAddress {
    EmailAddress::parse(s).unwrap()
}

fn client() -> EmailClient {
    let store = Arc::new(SqliteMailStore::open(":memory:").unwrap());
    EmailClient::with_store(
        CoreConfig::with_hosted_domains(["sealed.test"]),
        AccountId::generate(),
        store,
        Arc::new(LocalKeyStore::new()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_executable_attachment_is_refused() {
    // Scenario: a script disguised with an upper-case extension
    let client = client();
    let me = client.provision_address(&addr("me@sealed.test")).await.unwrap();
    let draft = Draft::new(addr("me@sealed.test"))
        .to(addr("victim@external.test"))
        .body("open me")
        .attach(Attachment {
            filename: "invoice.PDF.Exe".to_string(),
            mime_type: "application/pdf".to_string(),
            inline: false,
            content_id: None,
            data: vec![0x4d, 0x5a],
        });
    let err = client.send(&draft).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMessageContent);

    // Nothing reached storage
    let sent = client
        .list_all_messages(&ListQuery::new().scope(me.id))
        .await
        .unwrap();
    assert!(sent.items.is_empty());
}

#[tokio::test]
async fn test_spoofed_sender_is_refused() {
    let client = client();
    client.provision_address(&addr("me@sealed.test")).await.unwrap();
    let draft = Draft::new(addr("ceo@sealed.test"))
        .to(addr("finance@external.test"))
        .body("wire the money");
    let err = client.send(&draft).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnauthorizedAddress);
}

#[tokio::test]
async fn test_block_collapses_case_duplicates() {
    let client = client();
    let result = client
        .block_addresses(
            &[addr("Spam@Bad.test"), addr("spam@bad.TEST"), addr("  SPAM@BAD.TEST")],
            BlockScopeLevel::Address,
            BlockAction::Block,
            None,
        )
        .await
        .unwrap();
    assert_eq!(result.status(), BatchStatus::Success);
    assert_eq!(result.success_values().len(), 1);

    let entries = client.blocked_addresses().await.unwrap();
    assert_eq!(entries.len(), 1);
    // only the hash identifies the sender
    assert_eq!(entries[0].hashed_value, hash_blocked_value("spam@bad.test"));

    // Re-blocking as spam replaces the action
    client
        .block_addresses(
            &[addr("spam@bad.test")],
            BlockScopeLevel::Address,
            BlockAction::Spam,
            None,
        )
        .await
        .unwrap();
    let entries = client.blocked_addresses().await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].action, BlockAction::Spam);
}

#[tokio::test]
async fn test_domain_block_and_unblock() {
    let client = client();
    let me = client.provision_address(&addr("me@sealed.test")).await.unwrap();

    // 1. Blocking one sender at domain level covers the whole domain
    client
        .block_addresses(
            &[addr("sender1@bad.test")],
            BlockScopeLevel::Domain,
            BlockAction::Block,
            None,
        )
        .await
        .unwrap();
    let verdict = client.is_blocked(&addr("sender2@BAD.test"), &me.id).await.unwrap();
    assert_eq!(verdict, Some(BlockAction::Block));
    assert_eq!(
        client.is_blocked(&addr("friend@good.test"), &me.id).await.unwrap(),
        None
    );

    // 2. An address-level unblock leaves the domain rule in place
    let kept = client
        .unblock_addresses(&[addr("sender2@bad.test")], BlockScopeLevel::Address)
        .await
        .unwrap();
    assert_eq!(kept.status(), BatchStatus::Failure);
    let verdict = client.is_blocked(&addr("sender1@bad.test"), &me.id).await.unwrap();
    assert_eq!(verdict, Some(BlockAction::Block));

    // 3. A domain-level unblock through any address of the domain lifts it
    let lifted = client
        .unblock_addresses(&[addr("sender2@bad.test")], BlockScopeLevel::Domain)
        .await
        .unwrap();
    assert_eq!(lifted.status(), BatchStatus::Success);
    assert_eq!(
        client.is_blocked(&addr("sender1@bad.test"), &me.id).await.unwrap(),
        None
    );

    // 4. Nothing left to unblock
    let again = client
        .unblock_addresses(&[addr("sender1@bad.test")], BlockScopeLevel::Domain)
        .await
        .unwrap();
    assert_eq!(again.status(), BatchStatus::Failure);
    let cause = again.failure_cause(&addr("sender1@bad.test")).unwrap();
    assert_eq!(cause.kind, ErrorKind::NotFound);
}

#[tokio::test]
async fn test_address_unblock_keeps_domain_block() {
    let client = client();
    let me = client.provision_address(&addr("me@sealed.test")).await.unwrap();

    client
        .block_addresses(
            &[addr("postmaster@bad.test")],
            BlockScopeLevel::Domain,
            BlockAction::Block,
            None,
        )
        .await
        .unwrap();
    client
        .block_addresses(
            &[addr("friend@bad.test")],
            BlockScopeLevel::Address,
            BlockAction::Block,
            None,
        )
        .await
        .unwrap();

    let result = client
        .unblock_addresses(&[addr("friend@bad.test")], BlockScopeLevel::Address)
        .await
        .unwrap();
    assert_eq!(result.status(), BatchStatus::Success);
    assert_eq!(client.blocked_addresses().await.unwrap().len(), 1);
    let verdict = client.is_blocked(&addr("other@bad.test"), &me.id).await.unwrap();
    assert_eq!(verdict, Some(BlockAction::Block));
}

#[tokio::test]
async fn test_blocklist_is_private_to_account() {
    let store = Arc::new(SqliteMailStore::open(":memory:").unwrap());
    let on_store = || {
        EmailClient::with_store(
            CoreConfig::with_hosted_domains(["sealed.test"]),
            AccountId::generate(),
            store.clone(),
            Arc::new(LocalKeyStore::new()),
        )
        .unwrap()
    };
    let alice = on_store();
    let bob = on_store();
    alice.provision_address(&addr("alice@sealed.test")).await.unwrap();
    let bob_id = bob.provision_address(&addr("bob@sealed.test")).await.unwrap();

    alice
        .block_addresses(
            &[addr("news@shop.test")],
            BlockScopeLevel::Address,
            BlockAction::Block,
            None,
        )
        .await
        .unwrap();

    // 1. Bob sees none of Alice's rules and is not covered by them
    assert!(bob.blocked_addresses().await.unwrap().is_empty());
    let verdict = bob.is_blocked(&addr("news@shop.test"), &bob_id.id).await.unwrap();
    assert_eq!(verdict, None);

    // 2. Bob cannot lift them either
    let result = bob
        .unblock_addresses(&[addr("news@shop.test")], BlockScopeLevel::Address)
        .await
        .unwrap();
    assert_eq!(result.status(), BatchStatus::Failure);
    assert_eq!(alice.blocked_addresses().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_scoped_block_only_protects_owner() {
    let client = client();
    let r1 = client.provision_address(&addr("r1@sealed.test")).await.unwrap();
    let r2 = client.provision_address(&addr("r2@sealed.test")).await.unwrap();

    client
        .block_addresses(
            &[addr("s@bad.test")],
            BlockScopeLevel::Address,
            BlockAction::Spam,
            Some(r1.id.clone()),
        )
        .await
        .unwrap();
    assert_eq!(
        client.is_blocked(&addr("s@bad.test"), &r1.id).await.unwrap(),
        Some(BlockAction::Spam)
    );
    assert_eq!(client.is_blocked(&addr("s@bad.test"), &r2.id).await.unwrap(), None);
}

#[tokio::test]
async fn test_unblock_by_hash() {
    let client = client();
    client
        .block_addresses(
            &[addr("a@bad.test"), addr("b@bad.test")],
            BlockScopeLevel::Address,
            BlockAction::Block,
            None,
        )
        .await
        .unwrap();
    let hashes: Vec<String> = client
        .blocked_addresses()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.hashed_value)
        .collect();

    let mut targets = hashes.clone();
    targets.push("0".repeat(64));
    let result = client.unblock_hashed(&targets).await.unwrap();
    assert_eq!(result.status(), BatchStatus::Partial);
    assert_eq!(result.success_values().len(), 2);
    assert!(client.blocked_addresses().await.unwrap().is_empty());
}
