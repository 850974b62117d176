//! Minimal POP3 client. POP3 has no durable server-side flags and no
//! partial listing, so every `list_changes` is a full mailbox snapshot and
//! flag pushes are a local no-op echoed back as success.

use std::collections::{HashMap, HashSet};

use log::{info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::TcpStream;

use crate::adapter::imap::connect_tls;
use crate::adapter::{Cursor, Listing, MailAdapter, RawMessageEvent, RawMeta, RemoteFlags};
use crate::error::{AuthKind, SyncError};
use crate::model::{AccountConfig, EmailAccount};
use crate::normalize;

type TlsStream = tokio_native_tls::TlsStream<TcpStream>;

struct Pop3Connection {
    reader: BufReader<ReadHalf<TlsStream>>,
    writer: WriteHalf<TlsStream>,
}

impl Pop3Connection {
    async fn read_line(&mut self) -> Result<String, SyncError> {
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        if n == 0 {
            return Err(SyncError::Network("connection closed".to_string()));
        }
        Ok(line.trim_end().to_string())
    }

    /// Send one command and read its single status line. `+OK` yields the
    /// rest of the line, `-ERR` becomes a protocol error for the caller to
    /// reclassify.
    async fn command(&mut self, cmd: &str) -> Result<String, SyncError> {
        self.writer
            .write_all(format!("{}\r\n", cmd).as_bytes())
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;
        let line = self.read_line().await?;
        if let Some(rest) = line.strip_prefix("+OK") {
            Ok(rest.trim().to_string())
        } else if let Some(rest) = line.strip_prefix("-ERR") {
            Err(SyncError::Protocol(rest.trim().to_string()))
        } else {
            Err(SyncError::Protocol(format!("unexpected reply: {}", line)))
        }
    }

    /// Read a dot-terminated multiline response, undoing dot-stuffing.
    async fn read_multiline(&mut self) -> Result<Vec<String>, SyncError> {
        let mut lines = Vec::new();
        loop {
            let line = self.read_line().await?;
            if line == "." {
                break;
            }
            if let Some(stuffed) = line.strip_prefix("..") {
                lines.push(format!(".{}", stuffed));
            } else {
                lines.push(line);
            }
        }
        Ok(lines)
    }
}

pub struct Pop3Adapter {
    host: String,
    port: u16,
    username: String,
    password: String,
    conn: Option<Pop3Connection>,
    /// Stable id to this session's message number. Rebuilt per session;
    /// message numbers are only valid between connect and QUIT.
    index: HashMap<String, u32>,
}

impl Pop3Adapter {
    pub fn new(account: &EmailAccount) -> Result<Self, SyncError> {
        let config = &account.config;
        let missing = |field: &str| SyncError::Config(format!("missing {} in account config", field));
        Ok(Pop3Adapter {
            host: config.host.clone().ok_or_else(|| missing("host"))?,
            port: config.port.unwrap_or(995),
            username: config.username.clone().ok_or_else(|| missing("username"))?,
            password: config.password.clone().ok_or_else(|| missing("password"))?,
            conn: None,
            index: HashMap::new(),
        })
    }

    fn conn(&mut self) -> Result<&mut Pop3Connection, SyncError> {
        self.conn
            .as_mut()
            .ok_or_else(|| SyncError::Network("not connected".to_string()))
    }

    /// UIDL mapping when the server supports it, None otherwise.
    async fn uidl_map(&mut self) -> Result<Option<Vec<(u32, String)>>, SyncError> {
        let conn = self.conn()?;
        match conn.command("UIDL").await {
            Ok(_) => {
                let lines = conn.read_multiline().await?;
                let mut out = Vec::new();
                for line in lines {
                    let mut parts = line.split_whitespace();
                    let (Some(num), Some(token)) = (parts.next(), parts.next()) else {
                        continue;
                    };
                    if let Ok(num) = num.parse::<u32>() {
                        out.push((num, token.to_string()));
                    }
                }
                Ok(Some(out))
            }
            Err(SyncError::Protocol(msg)) => {
                info!("server has no UIDL ({}), falling back to content hashes", msg);
                Ok(None)
            }
            Err(other) => Err(other),
        }
    }

    async fn list_sizes(&mut self) -> Result<Vec<(u32, usize)>, SyncError> {
        let conn = self.conn()?;
        conn.command("LIST").await?;
        let lines = conn.read_multiline().await?;
        let mut out = Vec::new();
        for line in lines {
            let mut parts = line.split_whitespace();
            let (Some(num), Some(size)) = (parts.next(), parts.next()) else {
                continue;
            };
            if let (Ok(num), Ok(size)) = (num.parse::<u32>(), size.parse::<usize>()) {
                out.push((num, size));
            }
        }
        Ok(out)
    }

    async fn retr(&mut self, number: u32) -> Result<Vec<u8>, SyncError> {
        let conn = self.conn()?;
        match conn.command(&format!("RETR {}", number)).await {
            Ok(_) => {}
            Err(SyncError::Protocol(msg)) => return Err(SyncError::NotFound(msg)),
            Err(other) => return Err(other),
        }
        let lines = conn.read_multiline().await?;
        let mut raw = lines.join("\r\n").into_bytes();
        raw.extend_from_slice(b"\r\n");
        Ok(raw)
    }

    /// Make sure `self.index` maps stable ids to this session's message
    /// numbers. Needed when a delete or body fetch arrives before any
    /// listing on this connection.
    async fn ensure_index(&mut self) -> Result<(), SyncError> {
        if !self.index.is_empty() {
            return Ok(());
        }
        if let Some(pairs) = self.uidl_map().await? {
            for (num, token) in pairs {
                self.index.insert(format!("pop3:{}", token), num);
            }
            return Ok(());
        }
        // No UIDL: ids are content hashes, so every message gets pulled.
        let sizes = self.list_sizes().await?;
        for (num, size) in sizes {
            let raw = self.retr(num).await?;
            let id = normalize::stable_id(&RawMeta::Pop3 { uidl: None, size }, &raw);
            self.index.insert(id, num);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl MailAdapter for Pop3Adapter {
    async fn connect(&mut self) -> Result<(), SyncError> {
        let tls_stream = connect_tls(&self.host, self.port).await?;
        let (read_half, write_half) = tokio::io::split(tls_stream);
        let mut conn = Pop3Connection {
            reader: BufReader::new(read_half),
            writer: write_half,
        };

        let greeting = conn.read_line().await?;
        if !greeting.starts_with("+OK") {
            return Err(SyncError::Protocol(format!(
                "unexpected greeting: {}",
                greeting
            )));
        }

        conn.command(&format!("USER {}", self.username)).await?;
        if let Err(err) = conn.command(&format!("PASS {}", self.password)).await {
            return match err {
                // The server answered; the credentials did not pass.
                SyncError::Protocol(_) => Err(SyncError::Auth(AuthKind::Revoked)),
                other => Err(other),
            };
        }
        info!("-- logged in as {}", self.username);

        self.conn = Some(conn);
        self.index.clear();
        Ok(())
    }

    async fn list_changes(
        &mut self,
        _cursor: &Cursor,
        known: &[String],
    ) -> Result<Listing, SyncError> {
        let known: HashSet<&str> = known.iter().map(String::as_str).collect();
        self.index.clear();

        let mut events = Vec::new();

        if let Some(pairs) = self.uidl_map().await? {
            for (num, token) in pairs {
                let id = format!("pop3:{}", token);
                self.index.insert(id.clone(), num);
                if known.contains(id.as_str()) {
                    events.push(RawMessageEvent::Present { id });
                } else {
                    let raw = match self.retr(num).await {
                        Ok(raw) => raw,
                        Err(SyncError::NotFound(msg)) => {
                            warn!("message {} vanished mid-listing: {}", num, msg);
                            continue;
                        }
                        Err(other) => return Err(other),
                    };
                    let size = raw.len();
                    events.push(RawMessageEvent::Message {
                        meta: RawMeta::Pop3 {
                            uidl: Some(token),
                            size,
                        },
                        raw,
                        flags: RemoteFlags::default(),
                        labels: Vec::new(),
                    });
                }
            }
        } else {
            // Hash-identified mailbox: download everything, then decide.
            let sizes = self.list_sizes().await?;
            for (num, size) in sizes {
                let raw = match self.retr(num).await {
                    Ok(raw) => raw,
                    Err(SyncError::NotFound(_)) => continue,
                    Err(other) => return Err(other),
                };
                let meta = RawMeta::Pop3 { uidl: None, size };
                let id = normalize::stable_id(&meta, &raw);
                self.index.insert(id.clone(), num);
                if known.contains(id.as_str()) {
                    events.push(RawMessageEvent::Present { id });
                } else {
                    events.push(RawMessageEvent::Message {
                        meta,
                        raw,
                        flags: RemoteFlags::default(),
                        labels: Vec::new(),
                    });
                }
            }
        }

        Ok(Listing {
            events,
            cursor: Cursor::Pop3,
            full_snapshot: true,
        })
    }

    async fn fetch_body(&mut self, message_id: &str) -> Result<Vec<u8>, SyncError> {
        self.ensure_index().await?;
        let number = *self
            .index
            .get(message_id)
            .ok_or_else(|| SyncError::NotFound(message_id.to_string()))?;
        self.retr(number).await
    }

    /// No durable server-side flags on POP3; echo success.
    async fn apply_flag_change(
        &mut self,
        _message_id: &str,
        _flags: RemoteFlags,
    ) -> Result<(), SyncError> {
        Ok(())
    }

    async fn delete_message(&mut self, message_id: &str) -> Result<(), SyncError> {
        self.ensure_index().await?;
        let number = *self
            .index
            .get(message_id)
            .ok_or_else(|| SyncError::NotFound(message_id.to_string()))?;
        match self.conn()?.command(&format!("DELE {}", number)).await {
            Ok(_) => Ok(()),
            Err(SyncError::Protocol(msg)) => Err(SyncError::NotFound(msg)),
            Err(other) => Err(other),
        }
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
        if let Some(mut conn) = self.conn.take() {
            // QUIT commits any DELE issued this session
            if let Err(e) = conn.command("QUIT").await {
                warn!("QUIT failed: {}", e);
            }
        }
        self.index.clear();
    }
}
