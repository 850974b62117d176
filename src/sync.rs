//! Per-account sync engine: a state machine driving one protocol adapter,
//! reconciling remote listings against the local message set and feeding
//! new messages through the classification stage before anything is
//! surfaced.
//!
//! States: `Idle -> Connecting -> Syncing -> Idle` on success,
//! `Connecting/Syncing -> Backoff -> Connecting ...` on transient failure,
//! and `Disabled` (terminal until credential update) after a fatal auth
//! error.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use itertools::Itertools;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;

use crate::adapter::{MailAdapter, RawMessageEvent, RemoteFlags};
use crate::classify::{ClassificationStage, Outcome};
use crate::error::{AuthKind, SyncError};
use crate::events::{AccountStatusEvent, ChangeEvent, ChangeKind, EngineState};
use crate::model::{AccountConfig, Email};
use crate::normalize::{self, NormalizedEvent};
use crate::settings::DaemonConfig;
use crate::store::{FlagPush, MessageStore};

/// Commands accepted by a running engine. All account operations are
/// serialized through this channel, one engine task per account.
pub enum EngineCommand {
    /// Start a sync cycle. Triggers arriving while a cycle is in flight
    /// are coalesced into it.
    SyncNow,
    /// User re-auth: swap credentials, re-enable a disabled account and
    /// sync immediately.
    UpdateCredentials(AccountConfig),
    /// Local read/star mutation; pushed to the server on the next cycle.
    SetFlags {
        message_id: String,
        is_read: Option<bool>,
        is_starred: Option<bool>,
    },
    /// On-demand raw body fetch (lazy attachment content).
    FetchBody {
        message_id: String,
        respond_to: oneshot::Sender<Result<Vec<u8>, SyncError>>,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backoff_floor: Duration,
    pub backoff_ceiling: Duration,
    pub network_timeout: Duration,
    pub surface_failures_after: u32,
}

impl From<&DaemonConfig> for EngineConfig {
    fn from(config: &DaemonConfig) -> Self {
        EngineConfig {
            backoff_floor: Duration::from_secs(config.backoff_floor_seconds),
            backoff_ceiling: Duration::from_secs(config.backoff_ceiling_seconds),
            network_timeout: Duration::from_secs(config.network_timeout_seconds),
            surface_failures_after: config.surface_failures_after,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            backoff_floor: Duration::from_secs(2),
            backoff_ceiling: Duration::from_secs(300),
            network_timeout: Duration::from_secs(30),
            surface_failures_after: 5,
        }
    }
}

/// Bound every network call; expiry is a transient network failure.
async fn net<T, F>(limit: Duration, fut: F) -> Result<T, SyncError>
where
    F: Future<Output = Result<T, SyncError>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SyncError::Network("operation timed out".to_string())),
    }
}

fn backoff_delay(config: &EngineConfig, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let delay = config
        .backoff_floor
        .saturating_mul(2u32.saturating_pow(exp));
    delay.min(config.backoff_ceiling)
}

pub struct SyncEngine {
    account_id: String,
    adapter: Box<dyn MailAdapter>,
    store: Arc<MessageStore>,
    stage: ClassificationStage,
    changes: broadcast::Sender<ChangeEvent>,
    status: broadcast::Sender<AccountStatusEvent>,
    states: Arc<RwLock<HashMap<String, EngineState>>>,
    commands: mpsc::Receiver<EngineCommand>,
    config: EngineConfig,
    failures: u32,
    disabled: bool,
    shutting_down: bool,
    surfaced: bool,
    /// API key the classifier provider rejected; classification stays off
    /// for this account until the key changes.
    classifier_blocked_key: Option<String>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account_id: String,
        adapter: Box<dyn MailAdapter>,
        store: Arc<MessageStore>,
        stage: ClassificationStage,
        changes: broadcast::Sender<ChangeEvent>,
        status: broadcast::Sender<AccountStatusEvent>,
        states: Arc<RwLock<HashMap<String, EngineState>>>,
        config: EngineConfig,
    ) -> (Self, mpsc::Sender<EngineCommand>) {
        let (tx, rx) = mpsc::channel(32);
        let engine = SyncEngine {
            account_id,
            adapter,
            store,
            stage,
            changes,
            status,
            states,
            commands: rx,
            config,
            failures: 0,
            disabled: false,
            shutting_down: false,
            surfaced: false,
            classifier_blocked_key: None,
        };
        (engine, tx)
    }

    fn set_state(&self, state: EngineState) {
        self.states
            .write()
            .expect("state lock poisoned")
            .insert(self.account_id.clone(), state);
    }

    fn surface(&self, state: EngineState, detail: Option<String>) {
        let _ = self.status.send(AccountStatusEvent {
            account_id: self.account_id.clone(),
            state,
            consecutive_failures: self.failures,
            detail,
        });
    }

    fn emit(&self, kind: ChangeKind, email: Email) {
        let _ = self.changes.send(ChangeEvent {
            account_id: self.account_id.clone(),
            kind,
            email,
        });
    }

    /// Drive the engine until shutdown. One task per account; nothing here
    /// is shared with other accounts except the outbound channels.
    pub async fn run(mut self) {
        self.set_state(EngineState::Idle);
        while !self.shutting_down {
            let Some(command) = self.commands.recv().await else {
                break;
            };
            if !self.handle_command(command).await {
                break;
            }
        }
        self.adapter.disconnect().await;
        self.states
            .write()
            .expect("state lock poisoned")
            .remove(&self.account_id);
    }

    async fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::Shutdown => false,
            EngineCommand::SyncNow => {
                self.sync_cycle().await;
                !self.shutting_down
            }
            EngineCommand::UpdateCredentials(config) => {
                self.adapter.update_credentials(&config);
                self.failures = 0;
                if self.disabled {
                    info!("account {}: credentials updated, re-enabling", self.account_id);
                    self.disabled = false;
                }
                self.sync_cycle().await;
                !self.shutting_down
            }
            EngineCommand::SetFlags {
                message_id,
                is_read,
                is_starred,
            } => {
                self.handle_set_flags(&message_id, is_read, is_starred);
                true
            }
            EngineCommand::FetchBody {
                message_id,
                respond_to,
            } => {
                let result = self.handle_fetch_body(&message_id).await;
                let _ = respond_to.send(result);
                !self.shutting_down
            }
        }
    }

    async fn sync_cycle(&mut self) {
        if self.disabled {
            debug!(
                "account {}: disabled, ignoring sync trigger",
                self.account_id
            );
            return;
        }

        loop {
            self.set_state(EngineState::Connecting);
            match self.connect_with_refresh().await {
                Ok(()) => {}
                Err(SyncError::Auth(kind)) => {
                    self.disable(kind);
                    return;
                }
                Err(err) => {
                    if !self.backoff(&err).await {
                        return;
                    }
                    continue;
                }
            }

            self.set_state(EngineState::Syncing);
            let result = self.sync_once().await;
            self.adapter.disconnect().await;

            match result {
                Ok(()) => {
                    if self.surfaced {
                        self.surfaced = false;
                        self.failures = 0;
                        self.surface(EngineState::Idle, Some("recovered".to_string()));
                    }
                    self.failures = 0;
                    self.set_state(EngineState::Idle);
                    self.coalesce_queued_triggers();
                    return;
                }
                Err(SyncError::Auth(kind)) => {
                    self.disable(kind);
                    return;
                }
                Err(err) => {
                    if !self.backoff(&err).await {
                        return;
                    }
                }
            }
        }
    }

    /// Open a session, allowing at most one automatic credential refresh
    /// when the adapter reports an expired-token auth failure.
    async fn connect_with_refresh(&mut self) -> Result<(), SyncError> {
        let limit = self.config.network_timeout;
        match net(limit, self.adapter.connect()).await {
            Ok(()) => Ok(()),
            Err(SyncError::Auth(AuthKind::Expired)) => {
                match net(limit, self.adapter.refresh_credentials()).await {
                    Ok(true) => net(limit, self.adapter.connect()).await,
                    Ok(false) => Err(SyncError::Auth(AuthKind::Expired)),
                    Err(err) => Err(err),
                }
            }
            Err(err) => Err(err),
        }
    }

    fn disable(&mut self, kind: AuthKind) {
        error!(
            "account {}: fatal auth failure ({}), disabling until credential update",
            self.account_id, kind
        );
        self.disabled = true;
        self.set_state(EngineState::Disabled);
        self.surface(EngineState::Disabled, Some(kind.to_string()));
    }

    /// Wait out the exponential backoff delay while staying responsive to
    /// commands. Returns false when the engine should stop retrying.
    async fn backoff(&mut self, err: &SyncError) -> bool {
        self.failures += 1;
        let delay = backoff_delay(&self.config, self.failures);
        warn!(
            "account {}: sync failed ({}), retry {} in {:?}",
            self.account_id, err, self.failures, delay
        );
        self.set_state(EngineState::Backoff);
        if self.failures == self.config.surface_failures_after {
            self.surfaced = true;
            self.surface(EngineState::Backoff, Some(err.to_string()));
        }

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    None | Some(EngineCommand::Shutdown) => {
                        self.shutting_down = true;
                        return false;
                    }
                    // A manual trigger cuts the wait short
                    Some(EngineCommand::SyncNow) => return true,
                    Some(EngineCommand::UpdateCredentials(config)) => {
                        self.adapter.update_credentials(&config);
                        self.failures = 0;
                        return true;
                    }
                    Some(EngineCommand::SetFlags { message_id, is_read, is_starred }) => {
                        self.handle_set_flags(&message_id, is_read, is_starred);
                    }
                    Some(EngineCommand::FetchBody { respond_to, .. }) => {
                        let _ = respond_to.send(Err(SyncError::Network(
                            "account is reconnecting".to_string(),
                        )));
                    }
                },
            }
        }
    }

    /// Swallow sync triggers that piled up while a cycle was in flight.
    fn coalesce_queued_triggers(&mut self) {
        loop {
            match self.commands.try_recv() {
                Ok(EngineCommand::SyncNow) => continue,
                Ok(EngineCommand::Shutdown) => {
                    self.shutting_down = true;
                    return;
                }
                Ok(EngineCommand::SetFlags {
                    message_id,
                    is_read,
                    is_starred,
                }) => self.handle_set_flags(&message_id, is_read, is_starred),
                Ok(EngineCommand::UpdateCredentials(config)) => {
                    self.adapter.update_credentials(&config);
                }
                Ok(EngineCommand::FetchBody { respond_to, .. }) => {
                    let _ = respond_to.send(Err(SyncError::Network(
                        "busy, retry shortly".to_string(),
                    )));
                }
                Err(_) => return,
            }
        }
    }

    /// One full Syncing phase against an open session.
    async fn sync_once(&mut self) -> Result<(), SyncError> {
        let limit = self.config.network_timeout;

        self.push_pending_flags().await?;
        self.retry_pending_deletes().await?;

        let cursor = self.store.cursor();
        let known = self.store.known_ids();
        let listing = net(limit, self.adapter.list_changes(&cursor, &known)).await?;

        let events = self
            .reconcile(listing.events, listing.full_snapshot)
            .await;
        let emitted = events.len();
        for event in events {
            let _ = self.changes.send(event);
        }

        // Message set first, cursor last: the cursor write is the commit
        // point, so a crash in between replays the listing (at-least-once).
        self.store.persist_messages()?;
        self.store.set_cursor(listing.cursor)?;

        self.retry_unclassified().await?;

        if emitted > 0 {
            info!("account {}: emitted {} change events", self.account_id, emitted);
        }
        Ok(())
    }

    async fn push_pending_flags(&mut self) -> Result<(), SyncError> {
        let limit = self.config.network_timeout;
        for push in self.store.pending_flag_pushes() {
            match net(
                limit,
                self.adapter.apply_flag_change(&push.message_id, push.flags),
            )
            .await
            {
                Ok(()) => self.store.clear_flag_push(&push),
                Err(SyncError::Conflict(msg)) => {
                    // Local flag wins; the push stays queued for next cycle
                    warn!(
                        "account {}: flag push for {} rejected ({}), will retry",
                        self.account_id, push.message_id, msg
                    );
                }
                Err(SyncError::NotFound(_)) => {
                    // Message is gone; its removal arrives via the listing
                    self.store.clear_flag_push(&push);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn retry_pending_deletes(&mut self) -> Result<(), SyncError> {
        let limit = self.config.network_timeout;
        for id in self.store.pending_deletes() {
            match net(limit, self.adapter.delete_message(&id)).await {
                Ok(()) => {
                    debug!("account {}: remote delete of {} done", self.account_id, id);
                    self.store.confirm_delete(&id);
                }
                Err(SyncError::NotFound(_)) => self.store.confirm_delete(&id),
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    warn!(
                        "account {}: remote delete of {} failed ({}), keeping it withheld",
                        self.account_id, id, err
                    );
                }
            }
        }
        Ok(())
    }

    /// Diff the listing against the local set keyed by `(account_id, id)`.
    /// Events come back in listing order; replaying an identical listing
    /// produces no events. Infallible: a store mutation and its buffered
    /// event always leave this function together.
    async fn reconcile(
        &mut self,
        raw_events: Vec<RawMessageEvent>,
        full_snapshot: bool,
    ) -> Vec<ChangeEvent> {
        let mut out = Vec::new();
        let mut present: HashSet<String> = HashSet::new();

        for raw in raw_events {
            let normalized = match normalize::normalize_event(&self.account_id, raw) {
                Ok(event) => event,
                Err(err) => {
                    warn!(
                        "account {}: skipping unparseable listing entry: {}",
                        self.account_id, err
                    );
                    continue;
                }
            };

            match normalized {
                NormalizedEvent::Upsert(email) => {
                    present.insert(email.id.clone());
                    if self.store.is_withheld(&email.id) {
                        // Still hidden pending its remote delete
                        continue;
                    }
                    match self.store.get(&email.id) {
                        None => self.admit_new(email, &mut out).await,
                        Some(existing) => self.apply_update(existing, email, &mut out),
                    }
                }
                NormalizedEvent::Flags { id, flags } => {
                    present.insert(id.clone());
                    if self.store.is_withheld(&id) {
                        continue;
                    }
                    if let Some(existing) = self.store.get(&id) {
                        self.apply_flags_update(existing, flags, &mut out);
                    }
                }
                NormalizedEvent::Present { id } => {
                    present.insert(id);
                }
                NormalizedEvent::Removed { id } => {
                    self.apply_remove(&id, &mut out);
                }
            }
        }

        if full_snapshot {
            // Absence from a full snapshot is a deletion; incremental
            // listings never reach this branch.
            let vanished: Vec<String> = self
                .store
                .known_ids()
                .into_iter()
                .filter(|id| !present.contains(id))
                .sorted()
                .collect();
            for id in vanished {
                self.apply_remove(&id, &mut out);
            }
        }

        out
    }

    /// First observation of a message: classify, then either commit and
    /// emit the insert or withhold it behind a remote delete.
    async fn admit_new(&mut self, mut email: Email, out: &mut Vec<ChangeEvent>) {
        match self.classify(&mut email).await {
            Outcome::Keep => {
                self.store.insert(email.clone());
                out.push(ChangeEvent {
                    account_id: self.account_id.clone(),
                    kind: ChangeKind::Insert,
                    email,
                });
            }
            Outcome::Delete => {
                let id = email.id.clone();
                self.store.withhold(email);
                // Best effort; on failure the message stays withheld and
                // the delete is retried, never re-shown as undeleted.
                let limit = self.config.network_timeout;
                match net(limit, self.adapter.delete_message(&id)).await {
                    Ok(()) | Err(SyncError::NotFound(_)) => self.store.confirm_delete(&id),
                    Err(err) => warn!(
                        "account {}: auto-delete of {} failed ({}), withheld for retry",
                        self.account_id, id, err
                    ),
                }
            }
        }
    }

    fn apply_update(&mut self, existing: Email, mut incoming: Email, out: &mut Vec<ChangeEvent>) {
        // Classification is derived data; a refetch does not clear it
        incoming.ai_classification = existing.ai_classification.clone();
        if self.store.has_pending_flag_push(&existing.id) {
            // Local flags win until their push lands
            incoming.is_read = existing.is_read;
            incoming.is_starred = existing.is_starred;
        }
        if incoming != existing {
            self.store.update(incoming.clone());
            out.push(ChangeEvent {
                account_id: self.account_id.clone(),
                kind: ChangeKind::Update,
                email: incoming,
            });
        }
    }

    fn apply_flags_update(
        &mut self,
        existing: Email,
        flags: RemoteFlags,
        out: &mut Vec<ChangeEvent>,
    ) {
        if self.store.has_pending_flag_push(&existing.id) {
            return;
        }
        if existing.is_read == flags.seen && existing.is_starred == flags.flagged {
            return;
        }
        let mut updated = existing;
        updated.is_read = flags.seen;
        updated.is_starred = flags.flagged;
        self.store.update(updated.clone());
        out.push(ChangeEvent {
            account_id: self.account_id.clone(),
            kind: ChangeKind::Update,
            email: updated,
        });
    }

    fn apply_remove(&mut self, id: &str, out: &mut Vec<ChangeEvent>) {
        if self.store.is_withheld(id) {
            // Never surfaced, so it leaves without an event
            self.store.confirm_delete(id);
            self.store.remove(id);
            return;
        }
        if let Some(email) = self.store.remove(id) {
            out.push(ChangeEvent {
                account_id: self.account_id.clone(),
                kind: ChangeKind::Remove,
                email,
            });
        }
    }

    /// Classification with the account-scoped failure policy applied: any
    /// classifier failure commits the message unclassified (retried next
    /// cycle), a rejected API key turns classification off until the key
    /// changes. Never fails, so a broken classifier cannot leave a listing
    /// half-applied with its events unsent.
    async fn classify(&mut self, email: &mut Email) -> Outcome {
        if let Some(config) = self.stage.active_config() {
            if self.classifier_blocked_key.as_deref() == Some(config.api_key.as_str()) {
                return Outcome::Keep;
            }
            if self.classifier_blocked_key.is_some() {
                // A new key is in play; give the provider another chance
                self.classifier_blocked_key = None;
            }
        }

        match self.stage.process(email).await {
            Ok(outcome) => outcome,
            Err(SyncError::ProviderAuth) => {
                error!(
                    "account {}: classifier rejected the API key, disabling classification",
                    self.account_id
                );
                self.classifier_blocked_key =
                    self.stage.active_config().map(|config| config.api_key);
                self.surface(
                    EngineState::Syncing,
                    Some("classifier API key rejected".to_string()),
                );
                Outcome::Keep
            }
            Err(err) => {
                warn!(
                    "account {}: classification failed ({}), committing unclassified",
                    self.account_id, err
                );
                Outcome::Keep
            }
        }
    }

    /// Messages committed unclassified get another attempt each cycle
    /// while classification is enabled.
    async fn retry_unclassified(&mut self) -> Result<(), SyncError> {
        if self.stage.active_config().is_none() {
            return Ok(());
        }
        let ids = self.store.unclassified_ids();
        if ids.is_empty() {
            return Ok(());
        }

        let mut changed = false;
        for id in ids {
            let Some(mut email) = self.store.get(&id) else {
                continue;
            };
            let outcome = self.classify(&mut email).await;
            if email.ai_classification.is_none() {
                // Provider still unavailable or key still blocked
                continue;
            }
            changed = true;
            match outcome {
                Outcome::Keep => {
                    self.store.update(email.clone());
                    self.emit(ChangeKind::Update, email);
                }
                Outcome::Delete => {
                    // Already visible: retract it, then withhold
                    self.store.withhold(email.clone());
                    self.emit(ChangeKind::Remove, email);
                    let limit = self.config.network_timeout;
                    match net(limit, self.adapter.delete_message(&id)).await {
                        Ok(()) | Err(SyncError::NotFound(_)) => self.store.confirm_delete(&id),
                        Err(err) => warn!(
                            "account {}: auto-delete of {} failed ({}), withheld for retry",
                            self.account_id, id, err
                        ),
                    }
                }
            }
        }

        if changed {
            self.store.persist_messages()?;
        }
        Ok(())
    }

    fn handle_set_flags(
        &mut self,
        message_id: &str,
        is_read: Option<bool>,
        is_starred: Option<bool>,
    ) {
        let Some(updated) = self.store.set_local_flags(message_id, is_read, is_starred) else {
            warn!(
                "account {}: flag change for unknown message {}",
                self.account_id, message_id
            );
            return;
        };
        self.store.queue_flag_push(FlagPush {
            message_id: message_id.to_string(),
            flags: RemoteFlags {
                seen: updated.is_read,
                flagged: updated.is_starred,
            },
        });
        self.emit(ChangeKind::Update, updated);
        if let Err(err) = self.store.persist_messages() {
            error!("account {}: persist failed: {}", self.account_id, err);
        }
    }

    async fn handle_fetch_body(&mut self, message_id: &str) -> Result<Vec<u8>, SyncError> {
        if self.disabled {
            return Err(SyncError::Auth(AuthKind::Revoked));
        }
        self.set_state(EngineState::Connecting);
        if let Err(err) = self.connect_with_refresh().await {
            self.set_state(EngineState::Idle);
            if let SyncError::Auth(kind) = &err {
                self.disable(*kind);
            }
            return Err(err);
        }

        let limit = self.config.network_timeout;
        let result = net(limit, self.adapter.fetch_body(message_id)).await;
        self.adapter.disconnect().await;
        self.set_state(if self.disabled {
            EngineState::Disabled
        } else {
            EngineState::Idle
        });

        match result {
            Err(SyncError::NotFound(msg)) => {
                // Vanished mid-fetch: that is a removal
                let mut out = Vec::new();
                self.apply_remove(message_id, &mut out);
                for event in out {
                    let _ = self.changes.send(event);
                }
                self.store.persist_messages()?;
                Err(SyncError::NotFound(msg))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let config = EngineConfig {
            backoff_floor: Duration::from_secs(2),
            backoff_ceiling: Duration::from_secs(30),
            ..EngineConfig::default()
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(&config, 5), Duration::from_secs(30));
        assert_eq!(backoff_delay(&config, 30), Duration::from_secs(30));
    }
}
