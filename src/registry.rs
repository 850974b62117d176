//! Account registry: owns one engine task, one adapter and one message
//! store per account, and fans their change events out to subscribers.
//! Registry calls never block on another account's engine.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::adapter::{self, MailAdapter};
use crate::classify::{ClassificationStage, Classifier};
use crate::error::SyncError;
use crate::events::{AccountStatusEvent, ChangeEvent, EngineState};
use crate::model::{AppSettings, Email, EmailAccount};
use crate::settings::SettingsStore;
use crate::store::{self, MessageStore};
use crate::sync::{EngineCommand, EngineConfig, SyncEngine};

/// Builds the adapter for an account. Swappable so tests can plug in
/// scripted adapters.
pub type AdapterFactory =
    Arc<dyn Fn(&EmailAccount) -> Result<Box<dyn MailAdapter>, SyncError> + Send + Sync>;

struct AccountEntry {
    account: EmailAccount,
    store: Arc<MessageStore>,
    commands: mpsc::Sender<EngineCommand>,
    task: JoinHandle<()>,
}

pub struct AccountRegistry {
    data_dir: PathBuf,
    settings: Arc<SettingsStore>,
    classifier: Arc<dyn Classifier>,
    adapter_factory: AdapterFactory,
    engine_config: EngineConfig,
    changes: broadcast::Sender<ChangeEvent>,
    status: broadcast::Sender<AccountStatusEvent>,
    states: Arc<RwLock<HashMap<String, EngineState>>>,
    accounts: Mutex<HashMap<String, AccountEntry>>,
}

impl AccountRegistry {
    pub fn new(
        data_dir: PathBuf,
        settings: Arc<SettingsStore>,
        classifier: Arc<dyn Classifier>,
        engine_config: EngineConfig,
    ) -> Self {
        Self::with_adapter_factory(
            data_dir,
            settings,
            classifier,
            engine_config,
            Arc::new(adapter::for_account),
        )
    }

    pub fn with_adapter_factory(
        data_dir: PathBuf,
        settings: Arc<SettingsStore>,
        classifier: Arc<dyn Classifier>,
        engine_config: EngineConfig,
        adapter_factory: AdapterFactory,
    ) -> Self {
        let (changes, _) = broadcast::channel(256);
        let (status, _) = broadcast::channel(64);
        AccountRegistry {
            data_dir,
            settings,
            classifier,
            adapter_factory,
            engine_config,
            changes,
            status,
            states: Arc::new(RwLock::new(HashMap::new())),
            accounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<AccountStatusEvent> {
        self.status.subscribe()
    }

    pub fn account_state(&self, account_id: &str) -> Option<EngineState> {
        self.states
            .read()
            .expect("state lock poisoned")
            .get(account_id)
            .copied()
    }

    fn lock_accounts(&self) -> std::sync::MutexGuard<'_, HashMap<String, AccountEntry>> {
        self.accounts.lock().expect("registry lock poisoned")
    }

    fn spawn_engine(
        &self,
        account: &EmailAccount,
        store: Arc<MessageStore>,
    ) -> Result<(mpsc::Sender<EngineCommand>, JoinHandle<()>), SyncError> {
        let adapter = (self.adapter_factory)(account)?;
        let stage = ClassificationStage::new(self.settings.clone(), self.classifier.clone());
        let (engine, commands) = SyncEngine::new(
            account.id.clone(),
            adapter,
            store,
            stage,
            self.changes.clone(),
            self.status.clone(),
            self.states.clone(),
            self.engine_config.clone(),
        );
        let task = tokio::spawn(engine.run());
        Ok((commands, task))
    }

    fn register(&self, account: EmailAccount) -> Result<(), SyncError> {
        let store = Arc::new(MessageStore::open(store::account_dir(
            &self.data_dir,
            &account.id,
        ))?);
        let (commands, task) = self.spawn_engine(&account, store.clone())?;
        self.lock_accounts().insert(
            account.id.clone(),
            AccountEntry {
                account,
                store,
                commands,
                task,
            },
        );
        Ok(())
    }

    /// Bring up engines for every account persisted under the data dir.
    pub fn load_persisted(&self) -> Result<usize, SyncError> {
        let accounts = store::load_accounts(&self.data_dir)?;
        let count = accounts.len();
        for account in accounts {
            info!("loaded account {} ({})", account.id, account.email);
            self.register(account)?;
        }
        Ok(count)
    }

    /// Add a new account: persist it (credentials encrypted) and start its
    /// engine. A missing id gets a generated one.
    pub fn add_account(&self, mut account: EmailAccount) -> Result<EmailAccount, SyncError> {
        if account.id.is_empty() {
            account.id = uuid::Uuid::new_v4().to_string();
        }
        if account.email.is_empty() {
            return Err(SyncError::Config("account has no email address".to_string()));
        }
        if self.lock_accounts().contains_key(&account.id) {
            return Err(SyncError::Config(format!(
                "account {} already exists",
                account.id
            )));
        }

        store::save_account(&self.data_dir, &account)?;
        self.register(account.clone())?;
        info!("added account {} ({})", account.id, account.email);
        Ok(account)
    }

    /// Adopt a config-file account unless it is already registered.
    pub fn ensure_account(&self, account: EmailAccount) -> Result<(), SyncError> {
        if self.lock_accounts().contains_key(&account.id) {
            return Ok(());
        }
        self.add_account(account)?;
        Ok(())
    }

    /// Stop the account's engine and delete everything stored for it.
    pub async fn remove_account(&self, account_id: &str) -> Result<(), SyncError> {
        let Some(mut entry) = self.lock_accounts().remove(account_id) else {
            return Err(SyncError::AccountNotFound(account_id.to_string()));
        };

        let _ = entry.commands.send(EngineCommand::Shutdown).await;
        if tokio::time::timeout(Duration::from_secs(5), &mut entry.task)
            .await
            .is_err()
        {
            warn!("engine for {} did not stop in time, aborting", account_id);
            entry.task.abort();
        }

        entry.store.discard()?;
        info!("removed account {}", account_id);
        Ok(())
    }

    /// Re-auth path: persist the new credentials and hand them to the
    /// engine, which re-enables a disabled account and syncs immediately.
    pub async fn update_account(&self, account: EmailAccount) -> Result<(), SyncError> {
        let commands = {
            let mut entries = self.lock_accounts();
            let entry = entries
                .get_mut(&account.id)
                .ok_or_else(|| SyncError::AccountNotFound(account.id.clone()))?;
            entry.account = account.clone();
            entry.commands.clone()
        };

        store::save_account(&self.data_dir, &account)?;
        commands
            .send(EngineCommand::UpdateCredentials(account.config))
            .await
            .map_err(|_| SyncError::AccountNotFound(account.id))?;
        Ok(())
    }

    /// Scrubbed account records, safe to show or serialize.
    pub fn list_accounts(&self) -> Vec<EmailAccount> {
        self.lock_accounts()
            .values()
            .map(|entry| {
                let mut account = entry.account.clone();
                account.config = account.config.scrubbed();
                account
            })
            .collect()
    }

    fn commands_for(&self, account_id: &str) -> Result<mpsc::Sender<EngineCommand>, SyncError> {
        self.lock_accounts()
            .get(account_id)
            .map(|entry| entry.commands.clone())
            .ok_or_else(|| SyncError::AccountNotFound(account_id.to_string()))
    }

    pub async fn sync_now(&self, account_id: &str) -> Result<(), SyncError> {
        let commands = self.commands_for(account_id)?;
        commands
            .send(EngineCommand::SyncNow)
            .await
            .map_err(|_| SyncError::AccountNotFound(account_id.to_string()))
    }

    /// Trigger a sync on every account. Engines mid-cycle coalesce the
    /// trigger; a full command queue just means one is already pending.
    pub fn sync_all(&self) {
        for (id, entry) in self.lock_accounts().iter() {
            if entry.commands.try_send(EngineCommand::SyncNow).is_err() {
                warn!("sync trigger for {} dropped (queue full)", id);
            }
        }
    }

    pub fn get_emails(&self, account_id: &str) -> Result<Vec<Email>, SyncError> {
        self.lock_accounts()
            .get(account_id)
            .map(|entry| entry.store.snapshot())
            .ok_or_else(|| SyncError::AccountNotFound(account_id.to_string()))
    }

    pub async fn set_flags(
        &self,
        account_id: &str,
        message_id: &str,
        is_read: Option<bool>,
        is_starred: Option<bool>,
    ) -> Result<(), SyncError> {
        let commands = self.commands_for(account_id)?;
        commands
            .send(EngineCommand::SetFlags {
                message_id: message_id.to_string(),
                is_read,
                is_starred,
            })
            .await
            .map_err(|_| SyncError::AccountNotFound(account_id.to_string()))
    }

    pub async fn fetch_body(
        &self,
        account_id: &str,
        message_id: &str,
    ) -> Result<Vec<u8>, SyncError> {
        let commands = self.commands_for(account_id)?;
        let (tx, rx) = oneshot::channel();
        commands
            .send(EngineCommand::FetchBody {
                message_id: message_id.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| SyncError::AccountNotFound(account_id.to_string()))?;
        rx.await
            .map_err(|_| SyncError::Network("engine stopped".to_string()))?
    }

    /// Swap the live application settings; engines pick them up on their
    /// next classify call.
    pub fn update_settings(&self, settings: AppSettings) {
        self.settings.update(settings);
    }

    /// Stop every engine, letting in-flight cycles finish their commit.
    pub async fn shutdown(&self) {
        let entries: Vec<(String, mpsc::Sender<EngineCommand>, JoinHandle<()>)> = {
            let mut accounts = self.lock_accounts();
            accounts
                .drain()
                .map(|(id, entry)| (id, entry.commands, entry.task))
                .collect()
        };

        for (_, commands, _) in &entries {
            let _ = commands.try_send(EngineCommand::Shutdown);
        }
        for (id, _, mut task) in entries {
            if tokio::time::timeout(Duration::from_secs(10), &mut task)
                .await
                .is_err()
            {
                warn!("engine for {} did not stop in time, aborting", id);
                task.abort();
            }
        }
    }
}
