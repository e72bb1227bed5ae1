use mailseal::keys::LocalKeyStore;
use mailseal::listing::{ListOutput, ListQuery};
use mailseal::batch::BatchStatus;
use mailseal::models::{AccountId, Draft, EncryptionStatus, MessageState, ProvisionedAddress};
use mailseal::storage::SqliteMailStore;
use mailseal::{CoreConfig, EmailAddress, EmailClient, ErrorKind};
use rand::seq::SliceRandom;
use std::sync::Arc;

// --- Agent ---
// One account on the shared service, with its own local key store
struct Agent {
    client: EmailClient,
    identity: ProvisionedAddress,
}

impl Agent {
    async fn new(store: Arc<SqliteMailStore>, username: &str) -> Self {
        let client = EmailClient::with_store(
            CoreConfig::with_hosted_domains(["sealed.test"]),
            AccountId::generate(),
            store,
            Arc::new(LocalKeyStore::new()),
        )
        .unwrap();
        let identity = client
            .provision_address(&EmailAddress::parse(&format!("{username}@sealed.test")).unwrap())
            .await
            .unwrap();
        Self { client, identity }
    }

    fn address(&self) -> EmailAddress {
        self.identity.address.clone()
    }

    async fn inbox(&self) -> Vec<mailseal::models::EmailMessage> {
        let page = self
            .client
            .list_all_messages(&ListQuery::new().scope(self.identity.id.clone()).limit(3))
            .await
            .unwrap();
        assert!(page.is_complete(), "{:?}", page.failures().collect::<Vec<_>>());
        page.successes().cloned().collect()
    }
}

#[tokio::test]
async fn test_multi_user_simulation() {
    let store = Arc::new(SqliteMailStore::open(":memory:").unwrap());
    let num_users = 5;
    let mut agents = Vec::new();

    // 1. Register agents on the shared service
    for i in 0..num_users {
        agents.push(Agent::new(store.clone(), &format!("user_{i}")).await);
    }

    // 2. Each round a random agent writes to another
    let iterations = 20;
    let mut expected = vec![0usize; num_users];
    for round in 0..iterations {
        let (sender_idx, recipient_idx) = {
            let mut rng = rand::thread_rng();
            let mut order: Vec<usize> = (0..num_users).collect();
            order.shuffle(&mut rng);
            (order[0], order[1])
        };
        let sender = &agents[sender_idx];
        let recipient = &agents[recipient_idx];

        let draft = Draft::new(sender.address())
            .to(recipient.address())
            .body(&format!("round {round}"));
        let receipt = sender.client.send(&draft).await.unwrap();
        assert_eq!(receipt.encryption_status, EncryptionStatus::Encrypted);
        expected[recipient_idx] += 1;
    }

    // 3. Every agent reads exactly its own inbound mail
    let mut total_received = 0;
    for (i, agent) in agents.iter().enumerate() {
        let received: Vec<_> = agent
            .inbox()
            .await
            .into_iter()
            .filter(|m| m.metadata.state == MessageState::Received)
            .collect();
        assert_eq!(received.len(), expected[i]);
        total_received += received.len();
    }
    assert_eq!(total_received, iterations);
}

#[tokio::test]
async fn test_other_accounts_cannot_read_mail() {
    let store = Arc::new(SqliteMailStore::open(":memory:").unwrap());
    let alice = Agent::new(store.clone(), "alice").await;
    let bob = Agent::new(store.clone(), "bob").await;
    let eve = Agent::new(store.clone(), "eve").await;

    let sealed = Draft::new(alice.address()).to(bob.address()).body("for bob only");
    let sealed = alice.client.send(&sealed).await.unwrap();
    let plain = Draft::new(alice.address())
        .to(EmailAddress::parse("lawyer@external.test").unwrap())
        .body("settlement terms");
    let plain = alice.client.send(&plain).await.unwrap();
    assert_eq!(plain.encryption_status, EncryptionStatus::Unencrypted);

    // 1. Nothing of Alice's shows up in Eve's listing
    assert!(eve.inbox().await.is_empty());
    let all = eve.client.list_all_messages(&ListQuery::new()).await.unwrap();
    assert!(all.items.is_empty());

    // 2. Naming Alice's identity or messages directly gets Eve nowhere
    let err = eve
        .client
        .page_messages(&ListQuery::new().scope(alice.identity.id.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnauthorizedAddress);
    for id in [&sealed.id, &plain.id] {
        let err = eve.client.get_message(id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
    let deleted = eve
        .client
        .delete_messages(&[plain.id.clone(), sealed.id.clone()])
        .await
        .unwrap();
    assert_eq!(deleted.status(), BatchStatus::Failure);

    // 3. Alice and Bob are unaffected
    let kept = alice.client.get_message(&plain.id).await.unwrap();
    assert_eq!(kept.metadata.state, MessageState::Sent);
    assert_eq!(bob.inbox().await.len(), 1);
}

#[tokio::test]
async fn test_key_reset_yields_failure_page() {
    let store = Arc::new(SqliteMailStore::open(":memory:").unwrap());
    let alice = Agent::new(store.clone(), "alice").await;
    let bob = Agent::new(store.clone(), "bob").await;

    for i in 0..3 {
        let draft = Draft::new(alice.address())
            .to(bob.address())
            .body(&format!("note {i}"));
        alice.client.send(&draft).await.unwrap();
    }

    // 1. Bob loses his keys
    bob.client.reset_keys().unwrap();

    // 2. Listing still answers, with every item failed and metadata kept
    let page = bob
        .client
        .page_messages(&ListQuery::new().scope(bob.identity.id.clone()))
        .await
        .unwrap();
    match page.into_output() {
        ListOutput::Partial { items, failed, .. } => {
            assert!(items.is_empty());
            assert_eq!(failed.len(), 3);
            for failure in failed {
                assert_eq!(failure.cause.kind, ErrorKind::Decryption);
                assert_eq!(failure.partial.from, alice.address());
                assert_eq!(failure.id, failure.partial.id.to_string());
            }
        }
        ListOutput::Success { .. } => panic!("expected a partial page"),
    }

    // 3. A single get surfaces the failure directly
    let any = bob
        .client
        .list_all_messages(&ListQuery::new().scope(bob.identity.id.clone()))
        .await
        .unwrap();
    let first = any.failures().next().unwrap();
    let err = bob
        .client
        .get_message(&first.partial.id)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Decryption);
}
