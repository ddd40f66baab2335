//! Best-effort push notifications for participants without a live
//! connection.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use hearth_shared::models::Message;
use hearth_shared::types::{ConversationId, MessageId, MessageKind, UserId};

/// Longest text preview pushed to devices, in characters.
const PREVIEW_CHARS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushSummary {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub sender_name: String,
    pub preview: String,
}

impl PushSummary {
    pub fn for_message(message: &Message, sender_name: &str) -> Self {
        let preview = match message.kind {
            MessageKind::Text | MessageKind::System => {
                let text = message.content.as_deref().unwrap_or_default();
                let mut preview: String = text.chars().take(PREVIEW_CHARS).collect();
                if text.chars().count() > PREVIEW_CHARS {
                    preview.push('…');
                }
                preview
            }
            MessageKind::Image => "Sent a photo".to_string(),
            MessageKind::Video => "Sent a video".to_string(),
            MessageKind::Audio => "Sent a voice message".to_string(),
            MessageKind::Document => "Sent a document".to_string(),
        };

        Self {
            conversation_id: message.conversation_id,
            message_id: message.id,
            sender_name: sender_name.to_string(),
            preview,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("push gateway answered {0}")]
    Rejected(reqwest::StatusCode),

    #[error("push request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn notify(&self, user_ids: &[UserId], summary: &PushSummary) -> Result<(), NotifyError>;
}

/// Used when no push gateway is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_ids: &[UserId], summary: &PushSummary) -> Result<(), NotifyError> {
        info!(
            recipients = user_ids.len(),
            conversation = %summary.conversation_id,
            message = %summary.message_id,
            "Push notification (no gateway configured)"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct PushRequest<'a> {
    user_ids: &'a [UserId],
    title: &'a str,
    body: &'a str,
    data: &'a PushSummary,
}

/// Posts one JSON request per fan-out to an external push gateway.
pub struct HttpPushNotifier {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpPushNotifier {
    pub fn new(url: String, api_key: Option<String>) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url,
            api_key,
        })
    }
}

#[async_trait]
impl Notifier for HttpPushNotifier {
    async fn notify(&self, user_ids: &[UserId], summary: &PushSummary) -> Result<(), NotifyError> {
        if user_ids.is_empty() {
            return Ok(());
        }

        let mut request = self.client.post(&self.url).json(&PushRequest {
            user_ids,
            title: &summary.sender_name,
            body: &summary.preview,
            data: summary,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Rejected(resp.status()));
        }
        Ok(())
    }
}
