use std::collections::HashSet;

use async_imap::types::{Fetch, Flag};
use async_imap::{Client, Session};
use futures::TryStreamExt;
use itertools::Itertools;
use log::{info, warn};
use tokio::net::TcpStream;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use crate::adapter::{Cursor, Listing, MailAdapter, RawMessageEvent, RawMeta, RemoteFlags};
use crate::error::{AuthKind, SyncError};
use crate::model::{AccountConfig, EmailAccount};
use crate::normalize;

pub(crate) type ImapSession = Session<Compat<tokio_native_tls::TlsStream<TcpStream>>>;

const MAILBOX: &str = "INBOX";

/// Password-authenticated IMAP mailbox.
pub struct ImapAdapter {
    host: String,
    port: u16,
    username: String,
    password: String,
    session: Option<ImapSession>,
}

impl ImapAdapter {
    pub fn new(account: &EmailAccount) -> Result<Self, SyncError> {
        let config = &account.config;
        Ok(ImapAdapter {
            host: required(&config.host, "host")?,
            port: config.port.unwrap_or(993),
            username: required(&config.username, "username")?,
            password: required(&config.password, "password")?,
            session: None,
        })
    }

    fn session(&mut self) -> Result<&mut ImapSession, SyncError> {
        self.session
            .as_mut()
            .ok_or_else(|| SyncError::Network("not connected".to_string()))
    }
}

fn required(value: &Option<String>, field: &str) -> Result<String, SyncError> {
    value
        .clone()
        .ok_or_else(|| SyncError::Config(format!("missing {} in account config", field)))
}

// Establish a TLS-encrypted connection to the IMAP server
pub(crate) async fn connect_tls(
    server: &str,
    port: u16,
) -> Result<tokio_native_tls::TlsStream<TcpStream>, SyncError> {
    let imap_addr = (server, port);
    let tcp_stream = TcpStream::connect(imap_addr)
        .await
        .map_err(|e| SyncError::Network(e.to_string()))?;
    let tls = tokio_native_tls::TlsConnector::from(
        native_tls::TlsConnector::new().map_err(|e| SyncError::Network(e.to_string()))?,
    );
    let tls_stream = tls
        .connect(server, tcp_stream)
        .await
        .map_err(|e| SyncError::Network(e.to_string()))?;

    info!("-- connected to {}:{}", server, port);
    Ok(tls_stream)
}

pub(crate) fn map_imap_err(err: async_imap::error::Error) -> SyncError {
    use async_imap::error::Error;
    match err {
        Error::Io(e) => SyncError::Network(e.to_string()),
        Error::ConnectionLost => SyncError::Network("connection lost".to_string()),
        other => SyncError::Protocol(other.to_string()),
    }
}

fn map_login_err(err: async_imap::error::Error) -> SyncError {
    use async_imap::error::Error;
    match err {
        Error::Io(e) => SyncError::Network(e.to_string()),
        Error::ConnectionLost => SyncError::Network("connection lost".to_string()),
        // The server answered; the credentials did not pass.
        _ => SyncError::Auth(AuthKind::Revoked),
    }
}

fn fetch_flags(fetch: &Fetch) -> RemoteFlags {
    let mut flags = RemoteFlags::default();
    for flag in fetch.flags() {
        match flag {
            Flag::Seen => flags.seen = true,
            Flag::Flagged => flags.flagged = true,
            _ => {}
        }
    }
    flags
}

fn uid_seq(uids: &[u32]) -> String {
    uids.iter().map(|u| u.to_string()).join(",")
}

/// List everything in the mailbox. Used for the first sync and after a
/// UID-validity epoch change.
async fn list_full(session: &mut ImapSession, uid_validity: u32) -> Result<Listing, SyncError> {
    let uids: Vec<u32> = session
        .uid_search("ALL")
        .await
        .map_err(map_imap_err)?
        .into_iter()
        .sorted()
        .collect();

    let mut events = Vec::new();
    let mut last_uid = 0;

    if !uids.is_empty() {
        let stream = session
            .uid_fetch(&uid_seq(&uids), "(UID FLAGS BODY.PEEK[])")
            .await
            .map_err(map_imap_err)?;
        let fetches: Vec<Fetch> = stream.try_collect().await.map_err(map_imap_err)?;

        for fetch in fetches.iter().sorted_by_key(|f| f.uid.unwrap_or(0)) {
            let Some(uid) = fetch.uid else { continue };
            let Some(body) = fetch.body() else {
                warn!("uid {} fetched without a body, skipping", uid);
                continue;
            };
            last_uid = last_uid.max(uid);
            events.push(RawMessageEvent::Message {
                meta: RawMeta::Imap { uid_validity, uid },
                raw: body.to_vec(),
                flags: fetch_flags(fetch),
                labels: Vec::new(),
            });
        }
    }

    Ok(Listing {
        events,
        cursor: Cursor::Imap {
            uid_validity,
            last_uid,
        },
        full_snapshot: true,
    })
}

/// Incremental listing: re-read flags over the known UID range, derive
/// explicit expunges for known ids that vanished from it, then fetch
/// anything above the cursor.
async fn list_incremental(
    session: &mut ImapSession,
    uid_validity: u32,
    last_uid: u32,
    known: &[String],
) -> Result<Listing, SyncError> {
    let mut events = Vec::new();

    let mut survivors: HashSet<u32> = HashSet::new();
    if last_uid > 0 {
        let stream = session
            .uid_fetch(format!("1:{}", last_uid), "(UID FLAGS)")
            .await
            .map_err(map_imap_err)?;
        let fetches: Vec<Fetch> = stream.try_collect().await.map_err(map_imap_err)?;

        for fetch in fetches.iter().sorted_by_key(|f| f.uid.unwrap_or(0)) {
            let Some(uid) = fetch.uid else { continue };
            survivors.insert(uid);
            events.push(RawMessageEvent::FlagsChanged {
                meta: RawMeta::Imap { uid_validity, uid },
                flags: fetch_flags(fetch),
            });
        }
    }

    // A known UID missing from a complete range re-scan was expunged.
    for id in known {
        let Some((validity, uid)) = normalize::imap_parts(id) else {
            continue;
        };
        if validity == uid_validity && uid <= last_uid && !survivors.contains(&uid) {
            events.push(RawMessageEvent::Expunged { id: id.clone() });
        }
    }

    let found = session
        .uid_search(format!("UID {}:*", last_uid + 1))
        .await
        .map_err(map_imap_err)?;
    // Servers echo the highest existing UID even when nothing is newer
    let new_uids: Vec<u32> = found
        .into_iter()
        .filter(|&uid| uid > last_uid)
        .sorted()
        .collect();

    let mut next_last = last_uid;
    if !new_uids.is_empty() {
        let stream = session
            .uid_fetch(&uid_seq(&new_uids), "(UID FLAGS BODY.PEEK[])")
            .await
            .map_err(map_imap_err)?;
        let fetches: Vec<Fetch> = stream.try_collect().await.map_err(map_imap_err)?;

        for fetch in fetches.iter().sorted_by_key(|f| f.uid.unwrap_or(0)) {
            let Some(uid) = fetch.uid else { continue };
            let Some(body) = fetch.body() else {
                warn!("uid {} fetched without a body, skipping", uid);
                continue;
            };
            next_last = next_last.max(uid);
            events.push(RawMessageEvent::Message {
                meta: RawMeta::Imap { uid_validity, uid },
                raw: body.to_vec(),
                flags: fetch_flags(fetch),
                labels: Vec::new(),
            });
        }
    }

    Ok(Listing {
        events,
        cursor: Cursor::Imap {
            uid_validity,
            last_uid: next_last,
        },
        full_snapshot: false,
    })
}

pub(crate) async fn session_list_changes(
    session: &mut ImapSession,
    cursor: &Cursor,
    known: &[String],
) -> Result<Listing, SyncError> {
    let mailbox = session.select(MAILBOX).await.map_err(map_imap_err)?;
    info!("-- {} selected", MAILBOX);
    let uid_validity = mailbox.uid_validity.unwrap_or(0);

    match cursor {
        Cursor::Imap {
            uid_validity: seen_validity,
            last_uid,
        } if *seen_validity == uid_validity => {
            list_incremental(session, uid_validity, *last_uid, known).await
        }
        Cursor::Start => list_full(session, uid_validity).await,
        _ => {
            // All previously issued ids for this account are now invalid.
            info!(
                "UID validity changed on {}, forcing full resync",
                MAILBOX
            );
            list_full(session, uid_validity).await
        }
    }
}

pub(crate) async fn session_fetch_body(
    session: &mut ImapSession,
    message_id: &str,
) -> Result<Vec<u8>, SyncError> {
    let (validity, uid) = normalize::imap_parts(message_id)
        .ok_or_else(|| SyncError::NotFound(message_id.to_string()))?;

    let mailbox = session.select(MAILBOX).await.map_err(map_imap_err)?;
    if mailbox.uid_validity.unwrap_or(0) != validity {
        return Err(SyncError::NotFound(message_id.to_string()));
    }

    let stream = session
        .uid_fetch(uid.to_string(), "(UID BODY.PEEK[])")
        .await
        .map_err(map_imap_err)?;
    let fetches: Vec<Fetch> = stream.try_collect().await.map_err(map_imap_err)?;

    fetches
        .iter()
        .find(|f| f.uid == Some(uid))
        .and_then(|f| f.body())
        .map(|body| body.to_vec())
        .ok_or_else(|| SyncError::NotFound(message_id.to_string()))
}

pub(crate) async fn session_apply_flags(
    session: &mut ImapSession,
    message_id: &str,
    flags: RemoteFlags,
) -> Result<(), SyncError> {
    let (_, uid) = normalize::imap_parts(message_id)
        .ok_or_else(|| SyncError::NotFound(message_id.to_string()))?;
    session.select(MAILBOX).await.map_err(map_imap_err)?;

    for (flag, on) in [("\\Seen", flags.seen), ("\\Flagged", flags.flagged)] {
        let query = if on {
            format!("+FLAGS.SILENT ({})", flag)
        } else {
            format!("-FLAGS.SILENT ({})", flag)
        };
        let stream = session
            .uid_store(uid.to_string(), &query)
            .await
            .map_err(|e| match e {
                // Server refused the store: report as a conflict so the
                // local flag wins and the push is retried next cycle.
                async_imap::error::Error::No(msg) => SyncError::Conflict(msg),
                other => map_imap_err(other),
            })?;
        let _: Vec<Fetch> = stream.try_collect().await.map_err(map_imap_err)?;
    }
    Ok(())
}

pub(crate) async fn session_delete(
    session: &mut ImapSession,
    message_id: &str,
) -> Result<(), SyncError> {
    let (_, uid) = normalize::imap_parts(message_id)
        .ok_or_else(|| SyncError::NotFound(message_id.to_string()))?;
    session.select(MAILBOX).await.map_err(map_imap_err)?;

    let stream = session
        .uid_store(uid.to_string(), "+FLAGS.SILENT (\\Deleted)")
        .await
        .map_err(map_imap_err)?;
    let _: Vec<Fetch> = stream.try_collect().await.map_err(map_imap_err)?;

    let expunged = session.expunge().await.map_err(map_imap_err)?;
    let _: Vec<u32> = expunged.try_collect().await.map_err(map_imap_err)?;
    Ok(())
}

pub(crate) async fn session_logout(session: Option<ImapSession>) {
    if let Some(mut session) = session {
        // Be nice to the server and log out
        if let Err(e) = session.logout().await {
            warn!("logout failed: {}", e);
        }
    }
}

#[async_trait::async_trait]
impl MailAdapter for ImapAdapter {
    async fn connect(&mut self) -> Result<(), SyncError> {
        let tls_stream = connect_tls(&self.host, self.port).await?;
        let client = Client::new(tls_stream.compat());

        let session = client
            .login(&self.username, &self.password)
            .await
            .map_err(|e| map_login_err(e.0))?;
        info!("-- logged in as {}", self.username);

        self.session = Some(session);
        Ok(())
    }

    async fn list_changes(
        &mut self,
        cursor: &Cursor,
        known: &[String],
    ) -> Result<Listing, SyncError> {
        session_list_changes(self.session()?, cursor, known).await
    }

    async fn fetch_body(&mut self, message_id: &str) -> Result<Vec<u8>, SyncError> {
        session_fetch_body(self.session()?, message_id).await
    }

    async fn apply_flag_change(
        &mut self,
        message_id: &str,
        flags: RemoteFlags,
    ) -> Result<(), SyncError> {
        session_apply_flags(self.session()?, message_id, flags).await
    }

    async fn delete_message(&mut self, message_id: &str) -> Result<(), SyncError> {
        session_delete(self.session()?, message_id).await
    }

    fn update_credentials(&mut self, config: &AccountConfig) {
        if let Some(host) = &config.host {
            self.host = host.clone();
        }
        if let Some(port) = config.port {
            self.port = port;
        }
        if let Some(username) = &config.username {
            self.username = username.clone();
        }
        if let Some(password) = &config.password {
            self.password = password.clone();
        }
    }

    async fn disconnect(&mut self) {
        session_logout(self.session.take()).await;
    }
}
