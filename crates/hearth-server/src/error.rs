use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use hearth_shared::protocol::ServerEvent;
use hearth_shared::ProtocolError;
use hearth_store::StoreError;

use crate::media::MediaError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Authentication required: {0}")]
    Authentication(String),

    #[error("Not allowed: {0}")]
    Authorization(String),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Message blocked by content moderation")]
    ModerationBlocked { categories: Vec<String> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Too many events, slow down")]
    RateLimited,

    #[error("Dependency unavailable: {0}")]
    Dependency(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ServerError {
    /// Stable code carried in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            ServerError::Authentication(_) => "authentication_error",
            ServerError::Authorization(_) => "authorization_error",
            ServerError::Validation(_) => "validation_error",
            ServerError::ModerationBlocked { .. } => "moderation_blocked",
            ServerError::NotFound(_) => "not_found",
            ServerError::RateLimited => "rate_limited",
            ServerError::Dependency(_) => "dependency_error",
            ServerError::Store(_) => "store_error",
            ServerError::Internal(_) => "internal_error",
        }
    }

    /// Whether the client may reasonably retry the same request.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ServerError::RateLimited | ServerError::Dependency(_) | ServerError::Store(_)
        )
    }

    /// Render as an `error` event replying to `event`.
    pub fn to_event(&self, event: &str) -> ServerEvent {
        let (message, categories) = match self {
            ServerError::ModerationBlocked { categories } => (self.to_string(), categories.clone()),
            // Internal details stay in the logs.
            ServerError::Store(_) => ("Storage temporarily unavailable".to_string(), Vec::new()),
            ServerError::Internal(_) => ("Internal server error".to_string(), Vec::new()),
            _ => (self.to_string(), Vec::new()),
        };

        ServerEvent::Error {
            event: event.to_string(),
            code: self.code().to_string(),
            message,
            categories,
            retryable: self.retryable(),
        }
    }
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => ServerError::NotFound("record not found".into()),
            other => ServerError::Store(other),
        }
    }
}

impl From<ProtocolError> for ServerError {
    fn from(e: ProtocolError) -> Self {
        ServerError::Validation(e.to_string())
    }
}

impl From<MediaError> for ServerError {
    fn from(e: MediaError) -> Self {
        match e {
            MediaError::TooLarge { .. } | MediaError::Empty | MediaError::InvalidName => {
                ServerError::Validation(e.to_string())
            }
            MediaError::NotFound(name) => ServerError::NotFound(format!("media {name}")),
            other => ServerError::Dependency(format!("media storage: {other}")),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServerError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ServerError::Authorization(_) => StatusCode::FORBIDDEN,
            ServerError::Validation(_) => StatusCode::BAD_REQUEST,
            ServerError::ModerationBlocked { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ServerError::Dependency(_) => StatusCode::BAD_GATEWAY,
            ServerError::Store(_) | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }

        let message = match &self {
            ServerError::Store(_) | ServerError::Internal(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        };

        let body = serde_json::json!({
            "error": message,
            "code": self.code(),
        });

        (status, axum::Json(body)).into_response()
    }
}
