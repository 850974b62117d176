//! OAuth2 mailbox access, layered over IMAP: XOAUTH2 `AUTHENTICATE` against
//! the account's IMAP host, with automatic access-token refresh against the
//! provider's token endpoint.

use async_imap::Client;
use log::info;
use serde_json::Value;
use tokio_util::compat::TokioAsyncReadCompatExt;

use crate::adapter::imap::{
    connect_tls, session_apply_flags, session_delete, session_fetch_body,
    session_list_changes, session_logout, ImapSession,
};
use crate::adapter::{Cursor, Listing, MailAdapter, RemoteFlags};
use crate::error::{AuthKind, SyncError};
use crate::model::{AccountConfig, EmailAccount, Provider};

struct XOAuth2 {
    user: String,
    access_token: String,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

pub struct OAuthImapAdapter {
    host: String,
    port: u16,
    user: String,
    access_token: String,
    refresh_token: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    token_endpoint: Option<String>,
    http: reqwest::Client,
    session: Option<ImapSession>,
}

fn default_host(provider: Option<Provider>) -> Option<&'static str> {
    match provider {
        Some(Provider::Gmail) => Some("imap.gmail.com"),
        Some(Provider::Outlook) => Some("outlook.office365.com"),
        _ => None,
    }
}

fn token_endpoint(provider: Option<Provider>) -> Option<&'static str> {
    match provider {
        Some(Provider::Gmail) => Some("https://oauth2.googleapis.com/token"),
        Some(Provider::Outlook) => {
            Some("https://login.microsoftonline.com/common/oauth2/v2.0/token")
        }
        _ => None,
    }
}

impl OAuthImapAdapter {
    pub fn new(account: &EmailAccount) -> Result<Self, SyncError> {
        let config = &account.config;
        let host = config
            .host
            .clone()
            .or_else(|| default_host(account.provider).map(String::from))
            .ok_or_else(|| {
                SyncError::Config("missing host and no known provider default".to_string())
            })?;
        let user = config
            .username
            .clone()
            .unwrap_or_else(|| account.email.clone());
        let access_token = config
            .oauth_token
            .clone()
            .ok_or_else(|| SyncError::Config("missing oauth_token in account config".to_string()))?;

        Ok(OAuthImapAdapter {
            host,
            port: config.port.unwrap_or(993),
            user,
            access_token,
            refresh_token: config.refresh_token.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            token_endpoint: token_endpoint(account.provider).map(String::from),
            http: reqwest::Client::new(),
            session: None,
        })
    }

    fn session(&mut self) -> Result<&mut ImapSession, SyncError> {
        self.session
            .as_mut()
            .ok_or_else(|| SyncError::Network("not connected".to_string()))
    }
}

#[async_trait::async_trait]
impl MailAdapter for OAuthImapAdapter {
    async fn connect(&mut self) -> Result<(), SyncError> {
        let tls_stream = connect_tls(&self.host, self.port).await?;
        let client = Client::new(tls_stream.compat());

        let authenticator = XOAuth2 {
            user: self.user.clone(),
            access_token: self.access_token.clone(),
        };
        let session = client
            .authenticate("XOAUTH2", authenticator)
            .await
            .map_err(|e| match e.0 {
                async_imap::error::Error::Io(io) => SyncError::Network(io.to_string()),
                async_imap::error::Error::ConnectionLost => {
                    SyncError::Network("connection lost".to_string())
                }
                // Rejected token: assume expiry first, one refresh is
                // allowed before this becomes fatal.
                _ => SyncError::Auth(AuthKind::Expired),
            })?;
        info!("-- authenticated as {} via XOAUTH2", self.user);

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

    /// Exchange the refresh token for a fresh access token. `invalid_grant`
    /// means revoked consent; other rejections stay in the expired bucket.
    async fn refresh_credentials(&mut self) -> Result<bool, SyncError> {
        let Some(refresh_token) = self.refresh_token.clone() else {
            return Ok(false);
        };
        let Some(endpoint) = self.token_endpoint.clone() else {
            return Err(SyncError::Config(
                "no token endpoint known for this provider".to_string(),
            ));
        };

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token),
        ];
        if let Some(client_id) = &self.client_id {
            form.push(("client_id", client_id.clone()));
        }
        if let Some(client_secret) = &self.client_secret {
            form.push(("client_secret", client_secret.clone()));
        }

        let response = self
            .http
            .post(&endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| SyncError::Network(e.to_string()))?;

        if status.is_success() {
            let token = body["access_token"]
                .as_str()
                .ok_or_else(|| SyncError::Protocol("token response without access_token".to_string()))?;
            self.access_token = token.to_string();
            // Some providers rotate the refresh token
            if let Some(rotated) = body["refresh_token"].as_str() {
                self.refresh_token = Some(rotated.to_string());
            }
            info!("-- refreshed access token for {}", self.user);
            return Ok(true);
        }

        if body["error"].as_str() == Some("invalid_grant") {
            return Err(SyncError::Auth(AuthKind::Revoked));
        }
        if status.is_client_error() {
            return Err(SyncError::Auth(AuthKind::Expired));
        }
        Err(SyncError::Network(format!(
            "token endpoint returned {}",
            status
        )))
    }

    fn update_credentials(&mut self, config: &AccountConfig) {
        if let Some(host) = &config.host {
            self.host = host.clone();
        }
        if let Some(port) = config.port {
            self.port = port;
        }
        if let Some(username) = &config.username {
            self.user = username.clone();
        }
        if let Some(token) = &config.oauth_token {
            self.access_token = token.clone();
        }
        if let Some(refresh) = &config.refresh_token {
            self.refresh_token = Some(refresh.clone());
        }
        if let Some(client_id) = &config.client_id {
            self.client_id = Some(client_id.clone());
        }
        if let Some(client_secret) = &config.client_secret {
            self.client_secret = Some(client_secret.clone());
        }
    }

    async fn disconnect(&mut self) {
        session_logout(self.session.take()).await;
    }
}
