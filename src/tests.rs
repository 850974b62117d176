use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::adapter::{Cursor, Listing, MailAdapter, RawMessageEvent, RawMeta, RemoteFlags};
use crate::classify::{ClassificationStage, Classifier};
use crate::error::{AuthKind, SyncError};
use crate::events::{AccountStatusEvent, ChangeEvent, ChangeKind, EngineState};
use crate::model::{
    AIClassification, AIConfig, AIProvider, AccountConfig, AppSettings, Category,
};
use crate::settings::SettingsStore;
use crate::store::MessageStore;
use crate::sync::{EngineCommand, EngineConfig, SyncEngine};

const ACCOUNT: &str = "acct";

struct TestClassifier(Category);

#[async_trait]
impl Classifier for TestClassifier {
    async fn classify(
        &self,
        _subject: &str,
        _body_excerpt: &str,
        _sender: &str,
        _config: &AIConfig,
    ) -> Result<AIClassification, SyncError> {
        Ok(AIClassification {
            category: self.0,
            verification_code: None,
            verification_link: None,
            should_notify: matches!(self.0, Category::Important),
        })
    }
}

/// Fails with the queued errors first, then classifies as Normal.
struct FlakyClassifier {
    failures: Mutex<VecDeque<SyncError>>,
}

#[async_trait]
impl Classifier for FlakyClassifier {
    async fn classify(
        &self,
        _subject: &str,
        _body_excerpt: &str,
        _sender: &str,
        _config: &AIConfig,
    ) -> Result<AIClassification, SyncError> {
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(AIClassification {
            category: Category::Normal,
            verification_code: None,
            verification_link: None,
            should_notify: false,
        })
    }
}

#[derive(Default)]
struct Script {
    listings: VecDeque<Listing>,
    connect_results: VecDeque<Result<(), SyncError>>,
    refresh_results: VecDeque<Result<bool, SyncError>>,
    flag_results: VecDeque<Result<(), SyncError>>,
    delete_results: VecDeque<Result<(), SyncError>>,
    connects: usize,
    refreshes: usize,
    credential_updates: usize,
    deletes: Vec<String>,
    flag_pushes: Vec<(String, RemoteFlags)>,
}

struct ScriptedAdapter(Arc<Mutex<Script>>);

#[async_trait]
impl MailAdapter for ScriptedAdapter {
    async fn connect(&mut self) -> Result<(), SyncError> {
        let mut script = self.0.lock().unwrap();
        script.connects += 1;
        script.connect_results.pop_front().unwrap_or(Ok(()))
    }

    async fn list_changes(
        &mut self,
        cursor: &Cursor,
        _known: &[String],
    ) -> Result<Listing, SyncError> {
        let mut script = self.0.lock().unwrap();
        Ok(script.listings.pop_front().unwrap_or(Listing {
            events: vec![],
            cursor: cursor.clone(),
            full_snapshot: false,
        }))
    }

    async fn fetch_body(&mut self, message_id: &str) -> Result<Vec<u8>, SyncError> {
        Err(SyncError::NotFound(message_id.to_string()))
    }

    async fn apply_flag_change(
        &mut self,
        message_id: &str,
        flags: RemoteFlags,
    ) -> Result<(), SyncError> {
        let mut script = self.0.lock().unwrap();
        script.flag_pushes.push((message_id.to_string(), flags));
        script.flag_results.pop_front().unwrap_or(Ok(()))
    }

    async fn delete_message(&mut self, message_id: &str) -> Result<(), SyncError> {
        let mut script = self.0.lock().unwrap();
        script.deletes.push(message_id.to_string());
        script.delete_results.pop_front().unwrap_or(Ok(()))
    }

    async fn refresh_credentials(&mut self) -> Result<bool, SyncError> {
        let mut script = self.0.lock().unwrap();
        script.refreshes += 1;
        script.refresh_results.pop_front().unwrap_or(Ok(false))
    }

    fn update_credentials(&mut self, _config: &AccountConfig) {
        self.0.lock().unwrap().credential_updates += 1;
    }

    async fn disconnect(&mut self) {}
}

struct Harness {
    script: Arc<Mutex<Script>>,
    store: Arc<MessageStore>,
    states: Arc<RwLock<HashMap<String, EngineState>>>,
    commands: mpsc::Sender<EngineCommand>,
    changes: broadcast::Receiver<ChangeEvent>,
    status: broadcast::Receiver<AccountStatusEvent>,
    task: JoinHandle<()>,
}

impl Harness {
    fn state(&self) -> Option<EngineState> {
        self.states.read().unwrap().get(ACCOUNT).copied()
    }

    fn drain_changes(&mut self) -> Vec<ChangeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.changes.try_recv() {
            events.push(event);
        }
        events
    }

    fn drain_status(&mut self) -> Vec<AccountStatusEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.status.try_recv() {
            events.push(event);
        }
        events
    }

    async fn sync_and_settle(&mut self) {
        self.commands.send(EngineCommand::SyncNow).await.unwrap();
        self.settle().await;
    }

    /// Wait for the engine to come to rest in Idle or Disabled.
    async fn settle(&self) {
        for _ in 0..500 {
            tokio::task::yield_now().await;
            match self.state() {
                Some(EngineState::Idle) | Some(EngineState::Disabled) => return,
                _ => tokio::time::sleep(Duration::from_millis(2)).await,
            }
        }
        panic!("engine did not settle");
    }

    async fn finish(self) {
        let _ = self.commands.send(EngineCommand::Shutdown).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        backoff_floor: Duration::from_millis(1),
        backoff_ceiling: Duration::from_millis(10),
        network_timeout: Duration::from_secs(5),
        surface_failures_after: 2,
    }
}

fn harness(settings: AppSettings, category: Category, script: Script) -> Harness {
    harness_with(settings, Arc::new(TestClassifier(category)), script)
}

fn harness_with(
    settings: AppSettings,
    classifier: Arc<dyn Classifier>,
    script: Script,
) -> Harness {
    let script = Arc::new(Mutex::new(script));
    let store = Arc::new(MessageStore::in_memory());
    let stage = ClassificationStage::new(Arc::new(SettingsStore::new(settings)), classifier);
    let (changes_tx, changes_rx) = broadcast::channel(256);
    let (status_tx, status_rx) = broadcast::channel(64);
    let states = Arc::new(RwLock::new(HashMap::new()));

    let (engine, commands) = SyncEngine::new(
        ACCOUNT.to_string(),
        Box::new(ScriptedAdapter(script.clone())),
        store.clone(),
        stage,
        changes_tx,
        status_tx,
        states.clone(),
        fast_config(),
    );
    let task = tokio::spawn(engine.run());

    Harness {
        script,
        store,
        states,
        commands,
        changes: changes_rx,
        status: status_rx,
        task,
    }
}

fn ai_settings(auto_delete: bool) -> AppSettings {
    AppSettings {
        notifications: true,
        ai_config: Some(AIConfig {
            enabled: true,
            provider: AIProvider::OpenAI,
            api_key: "test-key".to_string(),
            api_endpoint: None,
            model: None,
            auto_delete,
        }),
        theme: crate::model::Theme::System,
    }
}

fn raw_message(from: &str, subject: &str, body: &str) -> Vec<u8> {
    format!(
        "From: {}\r\nTo: me@example.com\r\nSubject: {}\r\n\
Date: Tue, 01 Jul 2025 10:00:00 +0000\r\nContent-Type: text/plain\r\n\r\n{}\r\n",
        from, subject, body
    )
    .into_bytes()
}

fn message(uid: u32, seen: bool, from: &str, subject: &str, body: &str) -> RawMessageEvent {
    RawMessageEvent::Message {
        meta: RawMeta::Imap {
            uid_validity: 1,
            uid,
        },
        raw: raw_message(from, subject, body),
        flags: RemoteFlags {
            seen,
            flagged: false,
        },
        labels: vec![],
    }
}

fn listing(events: Vec<RawMessageEvent>, last_uid: u32, full_snapshot: bool) -> Listing {
    Listing {
        events,
        cursor: Cursor::Imap {
            uid_validity: 1,
            last_uid,
        },
        full_snapshot,
    }
}

#[tokio::test]
async fn replaying_identical_snapshot_emits_nothing() {
    let snapshot = listing(
        vec![
            message(1, false, "a@example.com", "one", "first"),
            message(2, false, "b@example.com", "two", "second"),
        ],
        2,
        true,
    );
    let mut script = Script::default();
    script.listings.push_back(snapshot.clone());
    script.listings.push_back(snapshot);

    let mut h = harness(AppSettings::default(), Category::Normal, script);
    h.sync_and_settle().await;
    let first = h.drain_changes();
    assert_eq!(first.len(), 2);
    assert!(first.iter().all(|e| e.kind == ChangeKind::Insert));
    assert_eq!(
        h.store.cursor(),
        Cursor::Imap {
            uid_validity: 1,
            last_uid: 2
        }
    );

    h.sync_and_settle().await;
    assert!(h.drain_changes().is_empty());
    assert_eq!(h.store.snapshot().len(), 2);
    h.finish().await;
}

#[tokio::test]
async fn incremental_listing_yields_update_and_insert() {
    let mut script = Script::default();
    script.listings.push_back(listing(
        vec![
            message(1, false, "a@example.com", "one", "first"),
            message(2, false, "b@example.com", "two", "second"),
        ],
        2,
        true,
    ));
    script.listings.push_back(listing(
        vec![
            RawMessageEvent::FlagsChanged {
                meta: RawMeta::Imap {
                    uid_validity: 1,
                    uid: 2,
                },
                flags: RemoteFlags {
                    seen: true,
                    flagged: false,
                },
            },
            message(3, false, "c@example.com", "three", "third"),
        ],
        3,
        false,
    ));

    let mut h = harness(AppSettings::default(), Category::Normal, script);
    h.sync_and_settle().await;
    h.drain_changes();

    h.sync_and_settle().await;
    let events = h.drain_changes();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, ChangeKind::Update);
    assert_eq!(events[0].email.id, "imap:1:2");
    assert!(events[0].email.is_read);
    assert_eq!(events[1].kind, ChangeKind::Insert);
    assert_eq!(events[1].email.id, "imap:1:3");
    // Incremental listings never remove by absence
    assert_eq!(h.store.snapshot().len(), 3);
    h.finish().await;
}

#[tokio::test]
async fn absence_from_full_snapshot_is_a_removal() {
    let mut script = Script::default();
    script.listings.push_back(listing(
        vec![
            message(1, false, "a@example.com", "one", "first"),
            message(2, false, "b@example.com", "two", "second"),
        ],
        2,
        true,
    ));
    script.listings.push_back(listing(
        vec![RawMessageEvent::Present {
            id: "imap:1:1".to_string(),
        }],
        2,
        true,
    ));

    let mut h = harness(AppSettings::default(), Category::Normal, script);
    h.sync_and_settle().await;
    h.drain_changes();

    h.sync_and_settle().await;
    let events = h.drain_changes();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ChangeKind::Remove);
    assert_eq!(events[0].email.id, "imap:1:2");
    assert_eq!(h.store.snapshot().len(), 1);
    h.finish().await;
}

#[tokio::test]
async fn marketing_with_auto_delete_never_surfaces() {
    let mut script = Script::default();
    script.listings.push_back(listing(
        vec![message(1, false, "promo@shop.example", "SALE", "buy now")],
        1,
        true,
    ));

    let mut h = harness(ai_settings(true), Category::Marketing, script);
    h.sync_and_settle().await;

    assert!(h.drain_changes().is_empty());
    assert!(h.store.snapshot().is_empty());
    assert_eq!(h.script.lock().unwrap().deletes, vec!["imap:1:1"]);
    // Delete succeeded, so nothing is left pending
    assert!(h.store.known_ids().is_empty());
    h.finish().await;
}

#[tokio::test]
async fn marketing_without_auto_delete_is_kept() {
    let mut script = Script::default();
    script.listings.push_back(listing(
        vec![message(1, false, "promo@shop.example", "SALE", "buy now")],
        1,
        true,
    ));

    let mut h = harness(ai_settings(false), Category::Marketing, script);
    h.sync_and_settle().await;

    let events = h.drain_changes();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ChangeKind::Insert);
    let classification = events[0].email.ai_classification.as_ref().unwrap();
    assert_eq!(classification.category, Category::Marketing);
    assert!(h.script.lock().unwrap().deletes.is_empty());
    h.finish().await;
}

#[tokio::test]
async fn revoked_credentials_disable_the_account() {
    let mut script = Script::default();
    script
        .connect_results
        .push_back(Err(SyncError::Auth(AuthKind::Revoked)));

    let mut h = harness(AppSettings::default(), Category::Normal, script);
    h.sync_and_settle().await;
    assert_eq!(h.state(), Some(EngineState::Disabled));
    let statuses = h.drain_status();
    assert!(statuses
        .iter()
        .any(|s| s.state == EngineState::Disabled));

    // Further triggers must not reach the network, and the durable state
    // stays exactly as it was
    h.sync_and_settle().await;
    assert_eq!(h.script.lock().unwrap().connects, 1);
    assert!(h.store.snapshot().is_empty());
    assert_eq!(h.store.cursor(), Cursor::Start);
    h.finish().await;
}

#[tokio::test]
async fn expired_token_gets_exactly_one_refresh() {
    let mut script = Script::default();
    script
        .connect_results
        .push_back(Err(SyncError::Auth(AuthKind::Expired)));
    script.connect_results.push_back(Ok(()));
    script.refresh_results.push_back(Ok(true));
    script.listings.push_back(listing(
        vec![message(1, false, "a@example.com", "one", "first")],
        1,
        true,
    ));

    let mut h = harness(AppSettings::default(), Category::Normal, script);
    h.sync_and_settle().await;

    assert_eq!(h.state(), Some(EngineState::Idle));
    assert_eq!(h.drain_changes().len(), 1);
    let script = h.script.lock().unwrap();
    assert_eq!(script.connects, 2);
    assert_eq!(script.refreshes, 1);
    drop(script);
    h.finish().await;
}

#[tokio::test]
async fn failed_refresh_disables_the_account() {
    let mut script = Script::default();
    script
        .connect_results
        .push_back(Err(SyncError::Auth(AuthKind::Expired)));
    script.refresh_results.push_back(Ok(false));

    let h = harness(AppSettings::default(), Category::Normal, script);
    h.commands.send(EngineCommand::SyncNow).await.unwrap();
    h.settle().await;
    assert_eq!(h.state(), Some(EngineState::Disabled));
    h.finish().await;
}

#[tokio::test]
async fn credential_update_reenables_a_disabled_account() {
    let mut script = Script::default();
    script
        .connect_results
        .push_back(Err(SyncError::Auth(AuthKind::Revoked)));
    script.connect_results.push_back(Ok(()));
    script.listings.push_back(listing(
        vec![message(1, false, "a@example.com", "one", "first")],
        1,
        true,
    ));

    let mut h = harness(AppSettings::default(), Category::Normal, script);
    h.sync_and_settle().await;
    assert_eq!(h.state(), Some(EngineState::Disabled));

    let config = AccountConfig {
        host: None,
        port: None,
        username: None,
        password: Some("new-password".to_string()),
        oauth_token: None,
        refresh_token: None,
        client_id: None,
        client_secret: None,
    };
    h.commands
        .send(EngineCommand::UpdateCredentials(config))
        .await
        .unwrap();
    h.settle().await;

    assert_eq!(h.state(), Some(EngineState::Idle));
    assert_eq!(h.drain_changes().len(), 1);
    let script = h.script.lock().unwrap();
    assert_eq!(script.credential_updates, 1);
    assert_eq!(script.connects, 2);
    drop(script);
    h.finish().await;
}

#[tokio::test]
async fn transient_failures_back_off_and_recover() {
    let mut script = Script::default();
    script
        .connect_results
        .push_back(Err(SyncError::Network("refused".to_string())));
    script
        .connect_results
        .push_back(Err(SyncError::Network("refused".to_string())));
    script.connect_results.push_back(Ok(()));

    let mut h = harness(AppSettings::default(), Category::Normal, script);
    h.sync_and_settle().await;

    assert_eq!(h.state(), Some(EngineState::Idle));
    assert_eq!(h.script.lock().unwrap().connects, 3);
    let statuses = h.drain_status();
    // Surfaced at the configured threshold, then the recovery
    assert!(statuses.iter().any(|s| s.state == EngineState::Backoff));
    assert!(statuses
        .iter()
        .any(|s| s.state == EngineState::Idle && s.detail.as_deref() == Some("recovered")));
    h.finish().await;
}

#[tokio::test]
async fn local_flag_change_is_pushed_on_next_cycle() {
    let mut script = Script::default();
    script.listings.push_back(listing(
        vec![message(1, false, "a@example.com", "one", "first")],
        1,
        true,
    ));

    let mut h = harness(AppSettings::default(), Category::Normal, script);
    h.sync_and_settle().await;
    h.drain_changes();

    h.commands
        .send(EngineCommand::SetFlags {
            message_id: "imap:1:1".to_string(),
            is_read: Some(true),
            is_starred: None,
        })
        .await
        .unwrap();
    h.settle().await;

    let events = h.drain_changes();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ChangeKind::Update);
    assert!(events[0].email.is_read);
    assert!(h.store.has_pending_flag_push("imap:1:1"));

    h.sync_and_settle().await;
    let script = h.script.lock().unwrap();
    assert_eq!(script.flag_pushes.len(), 1);
    assert_eq!(script.flag_pushes[0].0, "imap:1:1");
    assert!(script.flag_pushes[0].1.seen);
    drop(script);
    assert!(!h.store.has_pending_flag_push("imap:1:1"));
    assert!(h.store.get("imap:1:1").unwrap().is_read);
    h.finish().await;
}

#[tokio::test]
async fn classifier_failure_never_loses_an_insert() {
    let mut script = Script::default();
    script.listings.push_back(listing(
        vec![
            message(1, false, "a@example.com", "one", "first"),
            message(2, false, "b@example.com", "two", "second"),
        ],
        2,
        true,
    ));

    // First classify call dies mid-listing; the message still has to go out
    let classifier = Arc::new(FlakyClassifier {
        failures: Mutex::new(VecDeque::from([SyncError::Network(
            "classifier unreachable".to_string(),
        )])),
    });
    let mut h = harness_with(ai_settings(false), classifier, script);
    h.sync_and_settle().await;

    let events = h.drain_changes();
    let inserts: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == ChangeKind::Insert)
        .map(|e| e.email.id.as_str())
        .collect();
    assert_eq!(inserts, vec!["imap:1:1", "imap:1:2"]);
    // The failed one was committed unclassified and picked up by the
    // retry pass in the same cycle
    assert!(events.iter().any(|e| e.kind == ChangeKind::Update
        && e.email.id == "imap:1:1"
        && e.email.ai_classification.is_some()));
    assert!(h
        .store
        .snapshot()
        .iter()
        .all(|e| e.ai_classification.is_some()));
    assert_eq!(
        h.store.cursor(),
        Cursor::Imap {
            uid_validity: 1,
            last_uid: 2
        }
    );
    h.finish().await;
}

#[tokio::test]
async fn conflicted_flag_push_keeps_local_value_and_retries() {
    let mut script = Script::default();
    script.listings.push_back(listing(
        vec![message(1, false, "a@example.com", "one", "first")],
        1,
        true,
    ));
    // Stale server flags race in while the push is still pending
    script.listings.push_back(listing(
        vec![RawMessageEvent::FlagsChanged {
            meta: RawMeta::Imap {
                uid_validity: 1,
                uid: 1,
            },
            flags: RemoteFlags {
                seen: false,
                flagged: false,
            },
        }],
        1,
        false,
    ));
    script
        .flag_results
        .push_back(Err(SyncError::Conflict("STORE rejected".to_string())));

    let mut h = harness(AppSettings::default(), Category::Normal, script);
    h.sync_and_settle().await;
    h.drain_changes();

    h.commands
        .send(EngineCommand::SetFlags {
            message_id: "imap:1:1".to_string(),
            is_read: Some(true),
            is_starred: None,
        })
        .await
        .unwrap();
    h.settle().await;
    h.drain_changes();

    // Rejected push: local value wins and the push stays queued
    h.sync_and_settle().await;
    assert!(h.store.has_pending_flag_push("imap:1:1"));
    assert!(h.store.get("imap:1:1").unwrap().is_read);
    assert!(h.drain_changes().is_empty());

    // Next cycle the push lands and the queue drains
    h.sync_and_settle().await;
    assert!(!h.store.has_pending_flag_push("imap:1:1"));
    assert!(h.store.get("imap:1:1").unwrap().is_read);
    assert_eq!(h.script.lock().unwrap().flag_pushes.len(), 2);
    h.finish().await;
}

#[tokio::test]
async fn failed_auto_delete_stays_withheld_until_it_lands() {
    let mut script = Script::default();
    script.listings.push_back(listing(
        vec![message(1, false, "promo@shop.example", "SALE", "buy now")],
        1,
        true,
    ));
    script
        .delete_results
        .push_back(Err(SyncError::Network("timed out".to_string())));

    let mut h = harness(ai_settings(true), Category::Marketing, script);
    h.sync_and_settle().await;

    // Delete failed: withheld, queued for retry, never surfaced
    assert!(h.drain_changes().is_empty());
    assert!(h.store.is_withheld("imap:1:1"));
    assert_eq!(h.store.pending_deletes(), vec!["imap:1:1"]);
    assert!(h.store.snapshot().is_empty());

    // Next cycle retries the delete and it sticks, still without events
    h.sync_and_settle().await;
    assert!(h.drain_changes().is_empty());
    assert!(h.store.known_ids().is_empty());
    assert!(h.store.pending_deletes().is_empty());
    assert_eq!(h.script.lock().unwrap().deletes.len(), 2);
    h.finish().await;
}

mod registry {
    use super::*;
    use crate::model::{EmailAccount, Protocol};
    use crate::registry::AccountRegistry;

    fn account(id: &str) -> EmailAccount {
        EmailAccount {
            id: id.to_string(),
            name: "Work".to_string(),
            email: "me@work.example".to_string(),
            display_name: None,
            tags: None,
            protocol: Protocol::Imap,
            provider: None,
            config: AccountConfig {
                host: Some("imap.work.example".to_string()),
                port: Some(993),
                username: Some("me".to_string()),
                password: Some("hunter2".to_string()),
                oauth_token: None,
                refresh_token: None,
                client_id: None,
                client_secret: None,
            },
        }
    }

    fn scripted_registry(data_dir: std::path::PathBuf) -> AccountRegistry {
        AccountRegistry::with_adapter_factory(
            data_dir,
            Arc::new(SettingsStore::new(AppSettings::default())),
            Arc::new(TestClassifier(Category::Normal)),
            fast_config(),
            Arc::new(|_account| {
                Ok(Box::new(ScriptedAdapter(Arc::new(Mutex::new(Script::default()))))
                    as Box<dyn MailAdapter>)
            }),
        )
    }

    #[tokio::test]
    async fn accounts_round_trip_with_scrubbed_listing() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = scripted_registry(tmp.path().to_path_buf());

        let added = registry.add_account(account("")).unwrap();
        assert!(!added.id.is_empty());

        let listed = registry.list_accounts();
        assert_eq!(listed.len(), 1);
        // Secrets never leave the registry
        assert!(listed[0].config.password.is_none());

        let on_disk = std::fs::read_to_string(
            crate::store::account_dir(tmp.path(), &added.id).join("account.json"),
        )
        .unwrap();
        assert!(!on_disk.contains("hunter2"));

        // Same account again is a no-op, a different id is a new account
        registry.ensure_account(added.clone()).unwrap();
        assert_eq!(registry.list_accounts().len(), 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn removal_deletes_everything_durable() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = scripted_registry(tmp.path().to_path_buf());

        let added = registry.add_account(account("acct-1")).unwrap();
        let dir = crate::store::account_dir(tmp.path(), &added.id);
        assert!(dir.exists());

        registry.remove_account(&added.id).await.unwrap();
        assert!(!dir.exists());
        assert!(registry.list_accounts().is_empty());
        assert!(matches!(
            registry.get_emails(&added.id),
            Err(SyncError::AccountNotFound(_))
        ));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_account_operations_fail_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let registry = scripted_registry(tmp.path().to_path_buf());
        assert!(matches!(
            registry.sync_now("nope").await,
            Err(SyncError::AccountNotFound(_))
        ));
        assert!(matches!(
            registry.remove_account("nope").await,
            Err(SyncError::AccountNotFound(_))
        ));
        registry.shutdown().await;
    }
}
