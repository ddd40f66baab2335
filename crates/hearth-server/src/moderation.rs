//! Content-safety checks.
//!
//! [`ModerationService`] is the external classifier. [`ModerationGateway`]
//! wraps it with timeouts, the fail-open policy, retrying media scans and
//! the verdict policy that maps scores to a [`SecurityStatus`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use hearth_shared::constants::{
    HIGH_RISK_CATEGORIES, MEDIA_BLOCK_CONFIDENCE, MEDIA_MODERATION_THRESHOLD,
    TEXT_BLOCK_CONFIDENCE, TEXT_MODERATION_THRESHOLD,
};
use hearth_shared::models::{ModerationSource, SecurityDetails};
use hearth_shared::types::SecurityStatus;

use crate::error::ServerError;

/// Raw classifier output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModerationResult {
    pub flagged: bool,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
}

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("moderation service timed out")]
    Timeout,

    #[error("no moderation service configured")]
    Unconfigured,

    #[error("moderation service unavailable: {0}")]
    Unavailable(String),

    #[error("moderation request failed: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait ModerationService: Send + Sync + 'static {
    async fn moderate_text(
        &self,
        text: &str,
        threshold: f64,
    ) -> Result<ModerationResult, ModerationError>;

    async fn moderate_media(
        &self,
        url: &str,
        threshold: f64,
    ) -> Result<ModerationResult, ModerationError>;
}

// ---------------------------------------------------------------------------
// Verdict policy
// ---------------------------------------------------------------------------

/// Map a classifier result to a status. High-risk categories count by their
/// base name, so `hate/threatening` is `hate`.
pub fn evaluate(
    result: &ModerationResult,
    source: ModerationSource,
    block_bound: f64,
    at: DateTime<Utc>,
) -> (SecurityStatus, SecurityDetails) {
    let mut high_risk: Vec<String> = Vec::new();
    for (category, score) in &result.scores {
        let base = category.split('/').next().unwrap_or(category);
        if *score > block_bound
            && HIGH_RISK_CATEGORIES.contains(&base)
            && !high_risk.iter().any(|c| c == base)
        {
            high_risk.push(base.to_string());
        }
    }

    let status = if !result.flagged {
        SecurityStatus::Passed
    } else if high_risk.is_empty() {
        SecurityStatus::Flagged
    } else {
        SecurityStatus::Blocked
    };

    let details = SecurityDetails {
        source,
        flagged: result.flagged,
        categories: result.categories.clone(),
        scores: result.scores.clone(),
        high_risk,
        checked_at: at,
    };
    (status, details)
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// A completed check.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub status: SecurityStatus,
    pub details: SecurityDetails,
}

#[derive(Debug, Clone)]
pub struct ModerationSettings {
    pub timeout: Duration,
    pub fail_open: bool,
    pub scan_max_attempts: u32,
    /// First retry delay; doubles per attempt.
    pub scan_backoff: Duration,
}

impl Default for ModerationSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            fail_open: true,
            scan_max_attempts: 3,
            scan_backoff: Duration::from_millis(500),
        }
    }
}

pub struct ModerationGateway {
    service: Option<Arc<dyn ModerationService>>,
    settings: ModerationSettings,
}

impl ModerationGateway {
    pub fn new(service: Option<Arc<dyn ModerationService>>, settings: ModerationSettings) -> Self {
        Self { service, settings }
    }

    /// Synchronous text check for a send or edit.
    ///
    /// `Ok(None)` means the check could not run and fail-open let the text
    /// through unchecked. A blocking verdict is returned as
    /// [`ServerError::ModerationBlocked`].
    pub async fn check_text(&self, text: &str) -> Result<Option<Verdict>, ServerError> {
        let outcome = match &self.service {
            Some(service) => {
                match tokio::time::timeout(
                    self.settings.timeout,
                    service.moderate_text(text, TEXT_MODERATION_THRESHOLD),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ModerationError::Timeout),
                }
            }
            None => Err(ModerationError::Unconfigured),
        };

        let result = match outcome {
            Ok(result) => result,
            Err(e) if self.settings.fail_open => {
                match e {
                    ModerationError::Unconfigured => debug!("Text moderation skipped: {e}"),
                    _ => warn!(error = %e, "Text moderation failed, accepting unchecked"),
                }
                return Ok(None);
            }
            Err(e) => return Err(ServerError::Dependency(e.to_string())),
        };

        let (status, details) = evaluate(
            &result,
            ModerationSource::Text,
            TEXT_BLOCK_CONFIDENCE,
            Utc::now(),
        );
        if status == SecurityStatus::Blocked {
            return Err(ServerError::ModerationBlocked {
                categories: details.high_risk,
            });
        }
        Ok(Some(Verdict { status, details }))
    }

    /// Scan stored media, retrying with exponential backoff and jitter.
    pub async fn scan_media(&self, url: &str) -> Result<Verdict, ModerationError> {
        let service = self.service.as_ref().ok_or(ModerationError::Unconfigured)?;
        let attempts = self.settings.scan_max_attempts.max(1);

        let mut attempt = 1;
        let result = loop {
            let outcome = match tokio::time::timeout(
                self.settings.timeout,
                service.moderate_media(url, MEDIA_MODERATION_THRESHOLD),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ModerationError::Timeout),
            };

            match outcome {
                Ok(result) => break result,
                Err(e) if attempt < attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        url,
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Media scan failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let (status, details) = evaluate(
            &result,
            ModerationSource::Media,
            MEDIA_BLOCK_CONFIDENCE,
            Utc::now(),
        );
        Ok(Verdict { status, details })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.settings.scan_backoff * 2u32.saturating_pow(attempt - 1);
        let jitter_cap = (base.as_millis() as u64 / 4).max(1);
        base + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_cap))
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct TextRequest<'a> {
    text: &'a str,
    threshold: f64,
}

#[derive(Serialize)]
struct MediaRequest<'a> {
    url: &'a str,
    threshold: f64,
}

/// JSON-over-HTTP classifier: `POST {base}/moderate/text` and
/// `POST {base}/moderate/media`, both answering a [`ModerationResult`].
pub struct HttpModerationClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpModerationClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ModerationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post<B: Serialize + Sync>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ModerationResult, ModerationError> {
        let mut request = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            return Err(ModerationError::Unavailable(format!(
                "service answered {}",
                resp.status()
            )));
        }
        Ok(resp.json::<ModerationResult>().await?)
    }
}

#[async_trait]
impl ModerationService for HttpModerationClient {
    async fn moderate_text(
        &self,
        text: &str,
        threshold: f64,
    ) -> Result<ModerationResult, ModerationError> {
        self.post("/moderate/text", &TextRequest { text, threshold })
            .await
    }

    async fn moderate_media(
        &self,
        url: &str,
        threshold: f64,
    ) -> Result<ModerationResult, ModerationError> {
        self.post("/moderate/media", &MediaRequest { url, threshold })
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::VecDeque;

    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;

    /// Scripted classifier: pops one queued outcome per call, then falls
    /// back to a clean result.
    #[derive(Default)]
    pub(crate) struct ScriptedModeration {
        pub(crate) text: Mutex<VecDeque<Result<ModerationResult, ModerationError>>>,
        pub(crate) media: Mutex<VecDeque<Result<ModerationResult, ModerationError>>>,
        pub(crate) media_calls: Mutex<Vec<String>>,
        text_gate: Mutex<Option<Arc<Notify>>>,
    }

    impl ScriptedModeration {
        pub(crate) fn push_text(&self, outcome: Result<ModerationResult, ModerationError>) {
            self.text.lock().push_back(outcome);
        }

        pub(crate) fn push_media(&self, outcome: Result<ModerationResult, ModerationError>) {
            self.media.lock().push_back(outcome);
        }

        /// The next text check waits until the returned gate is notified.
        pub(crate) fn hold_text(&self) -> Arc<Notify> {
            let gate = Arc::new(Notify::new());
            *self.text_gate.lock() = Some(gate.clone());
            gate
        }
    }

    #[async_trait]
    impl ModerationService for ScriptedModeration {
        async fn moderate_text(
            &self,
            _text: &str,
            _threshold: f64,
        ) -> Result<ModerationResult, ModerationError> {
            let gate = self.text_gate.lock().take();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            self.text
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(ModerationResult::default()))
        }

        async fn moderate_media(
            &self,
            url: &str,
            _threshold: f64,
        ) -> Result<ModerationResult, ModerationError> {
            self.media_calls.lock().push(url.to_string());
            self.media
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(ModerationResult::default()))
        }
    }

    pub(crate) fn flagged(category: &str, score: f64) -> ModerationResult {
        ModerationResult {
            flagged: true,
            categories: vec![category.to_string()],
            scores: BTreeMap::from([(category.to_string(), score)]),
        }
    }

    fn gateway(service: Arc<ScriptedModeration>, fail_open: bool) -> ModerationGateway {
        ModerationGateway::new(
            Some(service),
            ModerationSettings {
                timeout: Duration::from_secs(1),
                fail_open,
                scan_max_attempts: 3,
                scan_backoff: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn policy_maps_scores_to_status() {
        let now = Utc::now();
        let clean = ModerationResult::default();
        assert_eq!(
            evaluate(&clean, ModerationSource::Text, 0.85, now).0,
            SecurityStatus::Passed
        );

        let mild = flagged("harassment", 0.8);
        assert_eq!(
            evaluate(&mild, ModerationSource::Text, 0.85, now).0,
            SecurityStatus::Flagged
        );

        // Not a high-risk category, however confident.
        let spam = flagged("spam", 0.99);
        assert_eq!(
            evaluate(&spam, ModerationSource::Text, 0.85, now).0,
            SecurityStatus::Flagged
        );

        let (status, details) =
            evaluate(&flagged("hate/threatening", 0.95), ModerationSource::Text, 0.85, now);
        assert_eq!(status, SecurityStatus::Blocked);
        assert_eq!(details.high_risk, vec!["hate".to_string()]);

        // Above the text bound but below the media one.
        let media = flagged("violence", 0.88);
        assert_eq!(
            evaluate(&media, ModerationSource::Media, 0.9, now).0,
            SecurityStatus::Flagged
        );
    }

    #[tokio::test]
    async fn blocked_text_surfaces_categories() {
        let service = Arc::new(ScriptedModeration::default());
        service.push_text(Ok(flagged("hate", 0.95)));
        let gateway = gateway(service, true);

        match gateway.check_text("...").await {
            Err(ServerError::ModerationBlocked { categories }) => {
                assert_eq!(categories, vec!["hate".to_string()]);
            }
            other => panic!("expected a block, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failures_follow_fail_open_setting() {
        let service = Arc::new(ScriptedModeration::default());
        service.push_text(Err(ModerationError::Unavailable("down".into())));
        assert!(gateway(service.clone(), true)
            .check_text("hi")
            .await
            .unwrap()
            .is_none());

        service.push_text(Err(ModerationError::Unavailable("down".into())));
        assert!(matches!(
            gateway(service, false).check_text("hi").await,
            Err(ServerError::Dependency(_))
        ));

        let unconfigured = ModerationGateway::new(None, ModerationSettings::default());
        assert!(unconfigured.check_text("hi").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn media_scan_retries_then_succeeds() {
        let service = Arc::new(ScriptedModeration::default());
        service.push_media(Err(ModerationError::Timeout));
        service.push_media(Err(ModerationError::Unavailable("503".into())));
        service.push_media(Ok(flagged("violence", 0.95)));
        let gateway = gateway(service.clone(), true);

        let verdict = gateway.scan_media("/media/a.png").await.unwrap();
        assert_eq!(verdict.status, SecurityStatus::Blocked);
        assert_eq!(service.media_calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn media_scan_gives_up_after_max_attempts() {
        let service = Arc::new(ScriptedModeration::default());
        for _ in 0..3 {
            service.push_media(Err(ModerationError::Timeout));
        }
        let gateway = gateway(service.clone(), true);

        assert!(gateway.scan_media("/media/a.png").await.is_err());
        assert_eq!(service.media_calls.lock().len(), 3);
    }
}
