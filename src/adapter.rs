use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::model::{AccountConfig, EmailAccount, Protocol};

pub mod imap;
pub mod oauth;
pub mod pop3;

/// Opaque sync-progress marker. The engine stores and replays it without
/// looking inside; only the adapter that issued it interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cursor {
    /// No sync has completed yet; the next listing is a full snapshot.
    Start,
    /// IMAP: folder UID-validity epoch plus the highest UID already listed.
    Imap { uid_validity: u32, last_uid: u32 },
    /// POP3 has no incremental listing; the cursor only records that a
    /// snapshot was taken.
    Pop3,
}

impl Default for Cursor {
    fn default() -> Self {
        Cursor::Start
    }
}

/// Server-side flags in the subset the data model tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RemoteFlags {
    pub seen: bool,
    pub flagged: bool,
}

/// Protocol-specific identity material the normalizer turns into a stable id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawMeta {
    Imap { uid_validity: u32, uid: u32 },
    Pop3 { uidl: Option<String>, size: usize },
}

/// One entry in an adapter listing, in server listing order.
#[derive(Debug, Clone)]
pub enum RawMessageEvent {
    /// A message with its raw RFC822 bytes. New to this listing, or part of
    /// a full snapshot.
    Message {
        meta: RawMeta,
        raw: Vec<u8>,
        flags: RemoteFlags,
        labels: Vec<String>,
    },
    /// A known message whose flags were re-read (body not refetched).
    FlagsChanged { meta: RawMeta, flags: RemoteFlags },
    /// A known message confirmed still present, nothing changed that the
    /// adapter can see without refetching. Keeps full snapshots honest.
    Present { id: String },
    /// The server explicitly no longer has this message.
    Expunged { id: String },
}

/// Result of one `list_changes` call. Finite, restartable from `cursor`.
#[derive(Debug, Clone)]
pub struct Listing {
    pub events: Vec<RawMessageEvent>,
    pub cursor: Cursor,
    /// True when the listing covers the entire mailbox, so a known id
    /// absent from it really is gone. Incremental listings leave this false
    /// and removals come only from explicit [`RawMessageEvent::Expunged`].
    pub full_snapshot: bool,
}

/// Capability contract for one remote mailbox. One adapter instance per
/// account; the adapter owns its session between `connect` and `disconnect`.
#[async_trait]
pub trait MailAdapter: Send {
    /// Open an authenticated session.
    async fn connect(&mut self) -> Result<(), SyncError>;

    /// List changes since `cursor`. `known` carries the ids the engine
    /// already holds so the adapter can report explicit expunges.
    async fn list_changes(
        &mut self,
        cursor: &Cursor,
        known: &[String],
    ) -> Result<Listing, SyncError>;

    /// Fetch the full raw body for one message.
    async fn fetch_body(&mut self, message_id: &str) -> Result<Vec<u8>, SyncError>;

    /// Push a local flag change to the server. Protocols without durable
    /// server-side flags echo success without doing anything.
    async fn apply_flag_change(
        &mut self,
        message_id: &str,
        flags: RemoteFlags,
    ) -> Result<(), SyncError>;

    /// Delete the remote copy of one message.
    async fn delete_message(&mut self, message_id: &str) -> Result<(), SyncError>;

    /// Attempt an automatic credential refresh. Returns false when the
    /// protocol has nothing to refresh (plain password auth).
    async fn refresh_credentials(&mut self) -> Result<bool, SyncError> {
        Ok(false)
    }

    /// Replace the connection credentials (user re-auth path).
    fn update_credentials(&mut self, config: &AccountConfig);

    /// Close the session, best effort.
    async fn disconnect(&mut self);
}

/// Build the adapter for an account. Selection is by the declared protocol
/// tag, never by inspecting anything at runtime.
pub fn for_account(account: &EmailAccount) -> Result<Box<dyn MailAdapter>, SyncError> {
    match account.protocol {
        Protocol::Imap => Ok(Box::new(imap::ImapAdapter::new(account)?)),
        Protocol::Pop3 => Ok(Box::new(pop3::Pop3Adapter::new(account)?)),
        Protocol::OAuth2 => Ok(Box::new(oauth::OAuthImapAdapter::new(account)?)),
    }
}
