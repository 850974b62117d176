use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAccount {
    pub id: String,
    pub name: String,
    pub email: String,
    pub display_name: Option<String>,
    pub tags: Option<Vec<String>>,
    pub protocol: Protocol,
    pub provider: Option<Provider>,
    pub config: AccountConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Imap,
    Pop3,
    OAuth2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Outlook,
    Other,
}

/// Connection configuration for one account. Credentials are write-only from
/// the UI's perspective: `Debug` redacts them and [`AccountConfig::scrubbed`]
/// is what gets handed back out on listing.
#[derive(Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub oauth_token: Option<String>,
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
}

impl std::fmt::Debug for AccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("oauth_token", &self.oauth_token.as_ref().map(|_| "[REDACTED]"))
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl AccountConfig {
    /// Copy with every secret blanked out, for anything user-facing.
    pub fn scrubbed(&self) -> AccountConfig {
        AccountConfig {
            host: self.host.clone(),
            port: self.port,
            username: self.username.clone(),
            password: None,
            oauth_token: None,
            refresh_token: None,
            client_id: self.client_id.clone(),
            client_secret: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub id: String,
    pub account_id: String,
    pub subject: String,
    pub from: EmailAddress,
    pub to: Vec<EmailAddress>,
    pub cc: Option<Vec<EmailAddress>>,
    pub bcc: Option<Vec<EmailAddress>>,
    pub date: String,
    pub body: String,
    pub html_body: Option<String>,
    pub attachments: Option<Vec<Attachment>>,
    pub is_read: bool,
    pub is_starred: bool,
    pub labels: Option<Vec<String>>,
    pub ai_classification: Option<AIClassification>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    /// Base64 content, fetched on demand. Never populated during normal sync.
    pub content: Option<String>,
}

/// Derived annotation; replaceable without touching the Email identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AIClassification {
    pub category: Category,
    pub verification_code: Option<String>,
    pub verification_link: Option<String>,
    pub should_notify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Marketing,
    Important,
    Verification,
    Normal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AIConfig {
    pub enabled: bool,
    pub provider: AIProvider,
    pub api_key: String,
    pub api_endpoint: Option<String>,
    pub model: Option<String>,
    pub auto_delete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AIProvider {
    OpenAI,
    Anthropic,
    Gemini,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    pub notifications: bool,
    pub ai_config: Option<AIConfig>,
    pub theme: Theme,
}

impl Default for AppSettings {
    fn default() -> Self {
        AppSettings {
            notifications: true,
            ai_config: None,
            theme: Theme::System,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    System,
}
