//! Durable per-account state: the message set, the sync cursor and the
//! account record itself. Layout under the data dir:
//!
//! ```text
//! <data_dir>/.encryption_key
//! <data_dir>/accounts/<id>/account.json    (credentials encrypted)
//! <data_dir>/accounts/<id>/messages.json
//! <data_dir>/accounts/<id>/cursor.json     (the commit point)
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::adapter::{Cursor, RemoteFlags};
use crate::error::SyncError;
use crate::model::{Email, EmailAccount};
use crate::secrets;

/// A locally originated flag change waiting to be pushed to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlagPush {
    pub message_id: String,
    pub flags: RemoteFlags,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    emails: BTreeMap<String, Email>,
    /// Messages withheld from subscribers pending a remote delete.
    withheld: BTreeMap<String, Email>,
    pending_deletes: Vec<String>,
    pending_flags: Vec<FlagPush>,
}

#[derive(Debug, Default)]
struct StoreState {
    file: StoreFile,
    cursor: Cursor,
}

/// Message set for exactly one account. Only that account's sync engine
/// mutates it; everyone else gets cloned snapshots.
pub struct MessageStore {
    dir: Option<PathBuf>,
    state: Mutex<StoreState>,
}

impl MessageStore {
    /// Open (or create) the store for one account directory.
    pub fn open(dir: PathBuf) -> Result<Self, SyncError> {
        fs::create_dir_all(&dir)?;

        let messages_path = dir.join("messages.json");
        let file = if messages_path.exists() {
            let data = fs::read_to_string(&messages_path)?;
            serde_json::from_str(&data).unwrap_or_default()
        } else {
            StoreFile::default()
        };

        let cursor_path = dir.join("cursor.json");
        let cursor = if cursor_path.exists() {
            let data = fs::read_to_string(&cursor_path)?;
            serde_json::from_str(&data).unwrap_or(Cursor::Start)
        } else {
            Cursor::Start
        };

        Ok(MessageStore {
            dir: Some(dir),
            state: Mutex::new(StoreState { file, cursor }),
        })
    }

    /// Volatile store, used by tests and by accounts not yet persisted.
    pub fn in_memory() -> Self {
        MessageStore {
            dir: None,
            state: Mutex::new(StoreState {
                file: StoreFile::default(),
                cursor: Cursor::Start,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().expect("store lock poisoned")
    }

    /// Immutable copy of the visible message set.
    pub fn snapshot(&self) -> Vec<Email> {
        self.lock().file.emails.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Email> {
        self.lock().file.emails.get(id).cloned()
    }

    /// Every id the engine is tracking, withheld messages included, so the
    /// adapter can report expunges for all of them.
    pub fn known_ids(&self) -> Vec<String> {
        let state = self.lock();
        state
            .file
            .emails
            .keys()
            .chain(state.file.withheld.keys())
            .cloned()
            .collect()
    }

    pub fn is_withheld(&self, id: &str) -> bool {
        self.lock().file.withheld.contains_key(id)
    }

    pub fn insert(&self, email: Email) {
        self.lock().file.emails.insert(email.id.clone(), email);
    }

    pub fn update(&self, email: Email) {
        self.lock().file.emails.insert(email.id.clone(), email);
    }

    pub fn remove(&self, id: &str) -> Option<Email> {
        let mut state = self.lock();
        state.file.withheld.remove(id);
        state.file.pending_deletes.retain(|d| d != id);
        state.file.emails.remove(id)
    }

    /// Park a message out of sight pending its remote delete.
    pub fn withhold(&self, email: Email) {
        let mut state = self.lock();
        let id = email.id.clone();
        state.file.emails.remove(&id);
        state.file.withheld.insert(id.clone(), email);
        if !state.file.pending_deletes.contains(&id) {
            state.file.pending_deletes.push(id);
        }
    }

    pub fn pending_deletes(&self) -> Vec<String> {
        self.lock().file.pending_deletes.clone()
    }

    /// The remote copy is gone; drop the withheld message for good.
    pub fn confirm_delete(&self, id: &str) {
        let mut state = self.lock();
        state.file.pending_deletes.retain(|d| d != id);
        state.file.withheld.remove(id);
    }

    pub fn queue_flag_push(&self, push: FlagPush) {
        let mut state = self.lock();
        // Latest local change per message wins
        state
            .file
            .pending_flags
            .retain(|p| p.message_id != push.message_id);
        state.file.pending_flags.push(push);
    }

    pub fn pending_flag_pushes(&self) -> Vec<FlagPush> {
        self.lock().file.pending_flags.clone()
    }

    pub fn clear_flag_push(&self, push: &FlagPush) {
        self.lock().file.pending_flags.retain(|p| p != push);
    }

    pub fn has_pending_flag_push(&self, id: &str) -> bool {
        self.lock()
            .file
            .pending_flags
            .iter()
            .any(|p| p.message_id == id)
    }

    /// Apply a local read/star mutation, returning the updated copy.
    pub fn set_local_flags(
        &self,
        id: &str,
        is_read: Option<bool>,
        is_starred: Option<bool>,
    ) -> Option<Email> {
        let mut state = self.lock();
        let email = state.file.emails.get_mut(id)?;
        if let Some(read) = is_read {
            email.is_read = read;
        }
        if let Some(starred) = is_starred {
            email.is_starred = starred;
        }
        Some(email.clone())
    }

    /// Ids of visible messages still lacking a classification.
    pub fn unclassified_ids(&self) -> Vec<String> {
        self.lock()
            .file
            .emails
            .values()
            .filter(|e| e.ai_classification.is_none())
            .map(|e| e.id.clone())
            .collect()
    }

    pub fn cursor(&self) -> Cursor {
        self.lock().cursor.clone()
    }

    /// Persist the message set. Called before the cursor is advanced.
    pub fn persist_messages(&self) -> Result<(), SyncError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        let state = self.lock();
        let data = serde_json::to_string_pretty(&state.file)?;
        fs::write(dir.join("messages.json"), data)?;
        Ok(())
    }

    /// Advance and persist the cursor. This is the commit point: a crash
    /// before this write replays the whole listing on restart.
    pub fn set_cursor(&self, cursor: Cursor) -> Result<(), SyncError> {
        let mut state = self.lock();
        state.cursor = cursor;
        if let Some(dir) = &self.dir {
            let data = serde_json::to_string_pretty(&state.cursor)?;
            fs::write(dir.join("cursor.json"), data)?;
        }
        Ok(())
    }

    /// Wipe everything durable for this account (account removal path).
    pub fn discard(&self) -> Result<(), SyncError> {
        if let Some(dir) = &self.dir {
            if dir.exists() {
                fs::remove_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AccountFile {
    #[serde(flatten)]
    account: EmailAccount,
    credentials: String,
}

pub fn account_dir(data_dir: &Path, account_id: &str) -> PathBuf {
    data_dir.join("accounts").join(account_id)
}

/// Persist an account record with its credentials blob encrypted at rest.
pub fn save_account(data_dir: &Path, account: &EmailAccount) -> Result<(), SyncError> {
    let dir = account_dir(data_dir, &account.id);
    fs::create_dir_all(&dir)?;

    let credentials = secrets::encrypt_credentials(data_dir, &account.config)?;
    let mut record = account.clone();
    record.config = record.config.scrubbed();

    let file = AccountFile {
        account: record,
        credentials,
    };
    let data = serde_json::to_string_pretty(&file)?;
    fs::write(dir.join("account.json"), data)?;
    Ok(())
}

/// Load every persisted account, decrypting credential blobs.
pub fn load_accounts(data_dir: &Path) -> Result<Vec<EmailAccount>, SyncError> {
    let accounts_dir = data_dir.join("accounts");
    if !accounts_dir.exists() {
        return Ok(Vec::new());
    }

    let mut accounts = Vec::new();
    for entry in fs::read_dir(&accounts_dir)? {
        let path = entry?.path().join("account.json");
        if !path.exists() {
            continue;
        }
        let data = fs::read_to_string(&path)?;
        let file: AccountFile = serde_json::from_str(&data)?;
        let mut account = file.account;
        account.config = secrets::decrypt_credentials(data_dir, &file.credentials)?;
        accounts.push(account);
    }
    Ok(accounts)
}
