//! Classification stage: hands newly synced messages to a pluggable
//! classifier capability and decides what happens to them (surface, notify,
//! auto-delete). The provider wire format stays behind [`Classifier`].

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use regex::Regex;
use serde_json::json;

use crate::error::SyncError;
use crate::model::{AIClassification, AIConfig, AIProvider, Category, Email};
use crate::settings::SettingsStore;

/// Pluggable classifier capability. One call per message; the concrete
/// provider's request/response shape is hidden behind this interface.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        subject: &str,
        body_excerpt: &str,
        sender: &str,
        config: &AIConfig,
    ) -> Result<AIClassification, SyncError>;
}

/// What the sync engine should do with a processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Keep,
    /// Marketing + auto_delete: withhold the message and delete it remotely.
    Delete,
}

pub struct ClassificationStage {
    settings: Arc<SettingsStore>,
    classifier: Arc<dyn Classifier>,
}

impl ClassificationStage {
    pub fn new(settings: Arc<SettingsStore>, classifier: Arc<dyn Classifier>) -> Self {
        ClassificationStage {
            settings,
            classifier,
        }
    }

    /// Current AI config, re-read from the settings store. `None` when
    /// classification is off and the stage acts as a pass-through.
    pub fn active_config(&self) -> Option<AIConfig> {
        self.settings
            .current()
            .ai_config
            .filter(|config| config.enabled)
    }

    /// Classify one message in place and decide its fate.
    ///
    /// Provider failures propagate so the engine can commit the message
    /// unclassified and retry on the next cycle; a rejected API key comes
    /// back as [`SyncError::ProviderAuth`].
    pub async fn process(&self, email: &mut Email) -> Result<Outcome, SyncError> {
        // Settings are re-read on every call, never cached
        let settings = self.settings.current();
        let Some(config) = settings.ai_config.filter(|c| c.enabled) else {
            return Ok(Outcome::Keep);
        };

        let excerpt = excerpt(&email.body, 500);
        let classification = self
            .classifier
            .classify(&email.subject, &excerpt, &email.from.address, &config)
            .await?;

        if classification.should_notify && settings.notifications {
            // Delivery itself belongs to the notification collaborator
            info!(
                "notify: {} - from {}",
                email.subject, email.from.address
            );
        }

        let auto_delete =
            config.auto_delete && classification.category == Category::Marketing;
        email.ai_classification = Some(classification);

        if auto_delete {
            debug!("marketing message {} marked for auto-delete", email.id);
            Ok(Outcome::Delete)
        } else {
            Ok(Outcome::Keep)
        }
    }
}

fn excerpt(body: &str, max_chars: usize) -> String {
    body.chars().take(max_chars).collect()
}

/// Pull a verification code out of the message text, if any.
pub fn extract_verification_code(text: &str) -> Option<String> {
    // Common verification code patterns
    let patterns = [
        r"(?i)code[:：\s]+([A-Z0-9]{4,8})",
        r"(?i)verification[:：\s]+([A-Z0-9]{4,8})",
        r"(?i)([0-9]{4,8})\s+is\s+your\s+code",
        r"\b([0-9]{6})\b", // 6-digit codes are common
    ];

    for pattern in patterns {
        let regex = Regex::new(pattern).ok()?;
        if let Some(captures) = regex.captures(text) {
            if let Some(code) = captures.get(1) {
                return Some(code.as_str().to_string());
            }
        }
    }

    None
}

pub fn extract_verification_link(text: &str) -> Option<String> {
    let link_pattern =
        Regex::new(r#"https?://[^\s<>"]+(?:verify|confirm|activate|validation)[^\s<>"]*"#)
            .ok()?;

    link_pattern
        .captures(text)
        .and_then(|captures| captures.get(0))
        .map(|m| m.as_str().to_string())
}

/// HTTP-backed classifier speaking the OpenAI / Anthropic / Gemini chat
/// shapes, selected by the configured provider.
pub struct HttpClassifier {
    client: reqwest::Client,
}

impl HttpClassifier {
    pub fn new() -> Self {
        HttpClassifier {
            client: reqwest::Client::new(),
        }
    }

    async fn category_for(
        &self,
        subject: &str,
        body_excerpt: &str,
        config: &AIConfig,
    ) -> Result<Category, SyncError> {
        let prompt = format!(
            "Classify this email into one of these categories: marketing, important, verification, or normal.\n\nSubject: {}\n\nBody preview: {}\n\nRespond with just the category name.",
            subject, body_excerpt
        );

        let response = match config.provider {
            AIProvider::OpenAI => self.call_openai(&prompt, config).await?,
            AIProvider::Anthropic => self.call_anthropic(&prompt, config).await?,
            AIProvider::Gemini => self.call_gemini(&prompt, config).await?,
        };

        Ok(parse_category(&response))
    }

    async fn call_openai(&self, prompt: &str, config: &AIConfig) -> Result<String, SyncError> {
        let endpoint = config
            .api_endpoint
            .as_deref()
            .unwrap_or("https://api.openai.com/v1/chat/completions");
        let model = config.model.as_deref().unwrap_or("gpt-3.5-turbo");

        let response = self
            .client
            .post(endpoint)
            .header("Authorization", format!("Bearer {}", config.api_key))
            .json(&json!({
                "model": model,
                "messages": [
                    {"role": "user", "content": prompt}
                ],
                "max_tokens": 50,
                "temperature": 0.3
            }))
            .send()
            .await
            .map_err(provider_err)?;

        let data = check_status(response).await?;
        Ok(data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("normal")
            .to_string())
    }

    async fn call_anthropic(
        &self,
        prompt: &str,
        config: &AIConfig,
    ) -> Result<String, SyncError> {
        let endpoint = config
            .api_endpoint
            .as_deref()
            .unwrap_or("https://api.anthropic.com/v1/messages");
        let model = config.model.as_deref().unwrap_or("claude-3-haiku-20240307");

        let response = self
            .client
            .post(endpoint)
            .header("x-api-key", &config.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": model,
                "messages": [
                    {"role": "user", "content": prompt}
                ],
                "max_tokens": 50
            }))
            .send()
            .await
            .map_err(provider_err)?;

        let data = check_status(response).await?;
        Ok(data["content"][0]["text"]
            .as_str()
            .unwrap_or("normal")
            .to_string())
    }

    async fn call_gemini(&self, prompt: &str, config: &AIConfig) -> Result<String, SyncError> {
        let model = config.model.as_deref().unwrap_or("gemini-pro");
        let endpoint = match &config.api_endpoint {
            Some(base) => format!("{}?key={}", base, config.api_key),
            None => format!(
                "https://generativelanguage.googleapis.com/v1/models/{}:generateContent?key={}",
                model, config.api_key
            ),
        };

        let response = self
            .client
            .post(&endpoint)
            .json(&json!({
                "contents": [{
                    "parts": [{"text": prompt}]
                }]
            }))
            .send()
            .await
            .map_err(provider_err)?;

        let data = check_status(response).await?;
        Ok(data["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or("normal")
            .to_string())
    }
}

impl Default for HttpClassifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        subject: &str,
        body_excerpt: &str,
        _sender: &str,
        config: &AIConfig,
    ) -> Result<AIClassification, SyncError> {
        // Regex extraction first, provider call second
        let verification_code = extract_verification_code(body_excerpt);
        let verification_link = extract_verification_link(body_excerpt);

        let category = self.category_for(subject, body_excerpt, config).await?;
        let should_notify = matches!(category, Category::Important | Category::Verification);

        Ok(AIClassification {
            category,
            verification_code,
            verification_link,
            should_notify,
        })
    }
}

fn parse_category(response: &str) -> Category {
    let lower = response.to_lowercase();
    if lower.contains("marketing") {
        Category::Marketing
    } else if lower.contains("important") {
        Category::Important
    } else if lower.contains("verification") {
        Category::Verification
    } else {
        Category::Normal
    }
}

fn provider_err(err: reqwest::Error) -> SyncError {
    SyncError::Provider(err.to_string())
}

async fn check_status(response: reqwest::Response) -> Result<serde_json::Value, SyncError> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(SyncError::ProviderAuth);
    }
    if !status.is_success() {
        return Err(SyncError::Provider(format!(
            "provider returned {}",
            status
        )));
    }
    response
        .json::<serde_json::Value>()
        .await
        .map_err(provider_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppSettings, EmailAddress};
    use crate::settings::SettingsStore;

    struct FixedClassifier(Category);

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(
            &self,
            _subject: &str,
            body_excerpt: &str,
            _sender: &str,
            _config: &AIConfig,
        ) -> Result<AIClassification, SyncError> {
            Ok(AIClassification {
                category: self.0,
                verification_code: extract_verification_code(body_excerpt),
                verification_link: extract_verification_link(body_excerpt),
                should_notify: matches!(
                    self.0,
                    Category::Important | Category::Verification
                ),
            })
        }
    }

    fn email_with_body(body: &str) -> Email {
        Email {
            id: "m1".into(),
            account_id: "a".into(),
            subject: "hello".into(),
            from: EmailAddress {
                name: None,
                address: "x@y.z".into(),
            },
            to: vec![],
            cc: None,
            bcc: None,
            date: String::new(),
            body: body.into(),
            html_body: None,
            attachments: None,
            is_read: false,
            is_starred: false,
            labels: None,
            ai_classification: None,
        }
    }

    fn stage(category: Category, auto_delete: bool) -> ClassificationStage {
        let settings = Arc::new(SettingsStore::new(AppSettings {
            notifications: false,
            ai_config: Some(AIConfig {
                enabled: true,
                provider: AIProvider::OpenAI,
                api_key: "k".into(),
                api_endpoint: None,
                model: None,
                auto_delete,
            }),
            theme: crate::model::Theme::System,
        }));
        ClassificationStage::new(settings, Arc::new(FixedClassifier(category)))
    }

    #[tokio::test]
    async fn disabled_config_is_pass_through() {
        let settings = Arc::new(SettingsStore::new(AppSettings::default()));
        let stage =
            ClassificationStage::new(settings, Arc::new(FixedClassifier(Category::Marketing)));
        let mut email = email_with_body("buy now");
        let outcome = stage.process(&mut email).await.unwrap();
        assert_eq!(outcome, Outcome::Keep);
        assert!(email.ai_classification.is_none());
    }

    #[tokio::test]
    async fn marketing_with_auto_delete_yields_delete() {
        let stage = stage(Category::Marketing, true);
        let mut email = email_with_body("limited offer");
        let outcome = stage.process(&mut email).await.unwrap();
        assert_eq!(outcome, Outcome::Delete);
        assert_eq!(
            email.ai_classification.unwrap().category,
            Category::Marketing
        );
    }

    #[tokio::test]
    async fn marketing_without_auto_delete_is_kept() {
        let stage = stage(Category::Marketing, false);
        let mut email = email_with_body("limited offer");
        assert_eq!(stage.process(&mut email).await.unwrap(), Outcome::Keep);
    }

    #[tokio::test]
    async fn verification_details_are_attached() {
        let stage = stage(Category::Verification, false);
        let mut email = email_with_body(
            "Your code: 482913. Or visit https://example.com/verify?t=abc to confirm.",
        );
        stage.process(&mut email).await.unwrap();
        let classification = email.ai_classification.unwrap();
        assert_eq!(classification.verification_code.as_deref(), Some("482913"));
        assert_eq!(
            classification.verification_link.as_deref(),
            Some("https://example.com/verify?t=abc")
        );
        assert!(classification.should_notify);
    }

    #[test]
    fn category_parsing_is_forgiving() {
        assert_eq!(parse_category("Marketing."), Category::Marketing);
        assert_eq!(parse_category("This is IMPORTANT"), Category::Important);
        assert_eq!(parse_category("no idea"), Category::Normal);
    }

    #[test]
    fn code_extraction_patterns() {
        assert_eq!(
            extract_verification_code("Your code: AB12CD").as_deref(),
            Some("AB12CD")
        );
        assert_eq!(
            extract_verification_code("123456 is your code").as_deref(),
            Some("123456")
        );
        assert_eq!(extract_verification_code("no digits here"), None);
    }
}
