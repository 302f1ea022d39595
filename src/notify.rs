//! Outbound delivery of notifications to the Pushover messages API.

use crate::config::Credentials;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;

/// Production API root.
pub const PUSHOVER_API_BASE: &str = "https://api.pushover.net";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Optional presentation fields shared by every message sent in one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageOptions {
    pub title: Option<String>,
    pub priority: Option<i8>,
    pub url: Option<String>,
    pub url_title: Option<String>,
    /// Seconds between repeats of an emergency (priority 2) alert.
    pub retry: Option<u32>,
    /// Seconds after which an emergency alert stops repeating.
    pub expire: Option<u32>,
}

/// A single message ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub token: String,
    pub user_key: String,
    pub message: String,
    pub device: Option<String>,
    pub options: MessageOptions,
    /// Unix time shown as the message time.
    pub timestamp: i64,
}

impl Notification {
    pub fn new(credentials: &Credentials, options: &MessageOptions, message: String) -> Self {
        Self {
            token: credentials.token.clone(),
            user_key: credentials.user_key.clone(),
            message,
            device: credentials.device.clone(),
            options: options.clone(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    /// Form fields of the API request; unset options are left out.
    pub fn form_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("token", self.token.clone()),
            ("user", self.user_key.clone()),
            ("message", self.message.clone()),
            ("timestamp", self.timestamp.to_string()),
        ];
        let opts = &self.options;
        let optional = [
            ("device", self.device.clone()),
            ("title", opts.title.clone()),
            ("priority", opts.priority.map(|p| p.to_string())),
            ("url", opts.url.clone()),
            ("url_title", opts.url_title.clone()),
            ("retry", opts.retry.map(|r| r.to_string())),
            ("expire", opts.expire.map(|e| e.to_string())),
        ];
        fields.extend(
            optional
                .into_iter()
                .filter_map(|(name, value)| value.map(|v| (name, v))),
        );
        fields
    }
}

/// Acknowledgement returned by the notification service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    /// Service-assigned request id.
    pub request: String,
}

/// Delivers notifications somewhere.
pub trait Notifier {
    fn send(
        &self,
        notification: &Notification,
    ) -> impl Future<Output = Result<Receipt, NotifyError>> + Send;
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: i64,
    #[serde(default)]
    request: String,
    #[serde(default)]
    errors: Vec<String>,
}

/// HTTP client for the Pushover messages endpoint.
#[derive(Debug, Clone)]
pub struct PushoverClient {
    http: reqwest::Client,
    base_url: String,
}

impl PushoverClient {
    pub fn new() -> Result<Self, NotifyError> {
        Self::with_base_url(PUSHOVER_API_BASE)
    }

    /// Client talking to a different API root (used by tests).
    pub fn with_base_url(base_url: &str) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(NotifyError::Http)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/1/messages.json", self.base_url)
    }
}

impl Notifier for PushoverClient {
    async fn send(&self, notification: &Notification) -> Result<Receipt, NotifyError> {
        let url = self.messages_url();
        tracing::debug!(
            %url,
            bytes = notification.message.len(),
            priority = ?notification.options.priority,
            "sending notification"
        );

        let resp = self
            .http
            .post(&url)
            .form(&notification.form_fields())
            .send()
            .await
            .map_err(NotifyError::Http)?;
        let http_status = resp.status();
        let text = resp.text().await.map_err(NotifyError::Http)?;
        let body: ApiResponse =
            serde_json::from_str(&text).map_err(|source| NotifyError::Decode {
                status: http_status.as_u16(),
                source,
            })?;

        if body.status != 1 {
            tracing::warn!(%http_status, errors = ?body.errors, "notification rejected");
            return Err(NotifyError::Rejected {
                status: http_status.as_u16(),
                errors: body.errors,
            });
        }

        tracing::info!(request = %body.request, "notification delivered");
        Ok(Receipt {
            request: body.request,
        })
    }
}

/// Errors delivering a notification.
#[derive(Debug)]
pub enum NotifyError {
    /// Transport failure.
    Http(reqwest::Error),
    /// The response body was not the expected JSON.
    Decode {
        status: u16,
        source: serde_json::Error,
    },
    /// The service answered but refused the message.
    Rejected { status: u16, errors: Vec<String> },
}

impl std::fmt::Display for NotifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotifyError::Http(e) => write!(f, "notification request failed: {e}"),
            NotifyError::Decode { status, source } => {
                write!(f, "unexpected notification response (HTTP {status}): {source}")
            }
            NotifyError::Rejected { status, errors } => {
                write!(
                    f,
                    "notification rejected (HTTP {status}): {}",
                    errors.join("; ")
                )
            }
        }
    }
}

impl std::error::Error for NotifyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            NotifyError::Http(e) => Some(e),
            NotifyError::Decode { source, .. } => Some(source),
            NotifyError::Rejected { .. } => None,
        }
    }
}
