//! Messaging-platform capability trait and the rate-limited operation
//! executor that wraps every remote call with per-entity spacing, timeouts,
//! and tiered retry handling.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{error, warn};

pub const CRATE_NAME: &str = "tgstat-client";

/// Failure classes a platform call can surface. Everything the transport
/// reports is mapped into one of these before it reaches the executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    /// Not a member, admin required, or the entity is private. Never retried.
    #[error("access denied: {0}")]
    AccessDenied(String),
    /// Platform-dictated cooldown; the wait duration is authoritative.
    #[error("flood wait of {seconds}s imposed by platform")]
    FloodWait { seconds: u64 },
    /// The call exceeded the request timeout.
    #[error("platform call timed out")]
    Timeout,
    #[error("unexpected platform failure: {0}")]
    Unexpected(String),
}

impl PlatformError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, PlatformError::AccessDenied(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Channel,
    ForumChat,
    Other,
}

/// Resolved entity metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub id: i64,
    pub title: String,
    pub kind: EntityKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForumTopic {
    pub id: i64,
    pub title: String,
}

/// A message as the platform hands it over, before any shaping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformMessage {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub text: String,
}

/// The capabilities tgstat needs from the messaging platform. Each call is
/// one finite network operation; pagination across windows is the caller's
/// concern.
#[async_trait]
pub trait MessagingPlatform: Send + Sync {
    async fn resolve_entity(&self, entity_ref: &str) -> Result<EntityInfo, PlatformError>;

    async fn participant_count(&self, entity: &EntityInfo) -> Result<u64, PlatformError>;

    /// The most recent `limit` messages, newest-first.
    async fn recent_messages(
        &self,
        entity: &EntityInfo,
        limit: usize,
    ) -> Result<Vec<PlatformMessage>, PlatformError>;

    /// Id of the newest message, or `None` for an empty entity.
    async fn latest_message_id(&self, entity: &EntityInfo)
        -> Result<Option<i64>, PlatformError>;

    /// Forum topics; the platform caps enumeration at 100.
    async fn forum_topics(
        &self,
        entity: &EntityInfo,
        limit: usize,
    ) -> Result<Vec<ForumTopic>, PlatformError>;

    /// Messages of one topic with id in `(min_id, max_id]`, ascending.
    /// `max_id` of `None` means "up to the newest".
    async fn topic_messages(
        &self,
        entity: &EntityInfo,
        topic_id: i64,
        min_id: i64,
        max_id: Option<i64>,
    ) -> Result<Vec<PlatformMessage>, PlatformError>;
}

/// Spacing and retry knobs for the executor.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Minimum inter-request spacing per entity, also the backoff base.
    pub default_delay: Duration,
    pub backoff_factor: f64,
    /// Generic retry budget, and independently the per-entity flood budget.
    pub max_retries: u32,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            default_delay: Duration::from_secs(5),
            backoff_factor: 1.5,
            max_retries: 3,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.default_delay
            .mul_f64(self.backoff_factor.powi(attempt as i32))
    }
}

#[derive(Debug, Default)]
struct PacingState {
    last_contact: HashMap<String, Instant>,
    flood_retries: HashMap<String, u32>,
}

/// Wraps remote operations with per-entity min-interval spacing, a hard
/// timeout per attempt, and tiered retries. One instance lives for the whole
/// run; its pacing state is never reset between entities.
#[derive(Debug)]
pub struct RequestExecutor {
    policy: RetryPolicy,
    state: Mutex<PacingState>,
}

impl RequestExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(PacingState::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Suspend until `default_delay` has elapsed since the last contact with
    /// this entity, then record the new contact time.
    async fn pace(&self, entity_key: &str) {
        let remaining = {
            let state = self.state.lock().await;
            state.last_contact.get(entity_key).and_then(|last| {
                self.policy.default_delay.checked_sub(last.elapsed())
            })
        };
        if let Some(remaining) = remaining {
            if !remaining.is_zero() {
                sleep(remaining).await;
            }
        }
        let mut state = self.state.lock().await;
        state
            .last_contact
            .insert(entity_key.to_string(), Instant::now());
    }

    /// Consume one unit of the entity's flood budget; `false` once exhausted.
    async fn flood_budget_allows(&self, entity_key: &str) -> bool {
        let mut state = self.state.lock().await;
        let counter = state
            .flood_retries
            .entry(entity_key.to_string())
            .or_insert(0);
        *counter += 1;
        *counter <= self.policy.max_retries
    }

    /// Execute `op` for `entity_key` under the retry policy.
    ///
    /// AccessDenied is fatal immediately. FloodWait honors the dictated wait
    /// and draws on a per-entity budget independent of the generic one.
    /// Timeout and Unexpected retry with exponential backoff up to
    /// `max_retries`, then surface to the caller.
    pub async fn execute<T, F, Fut>(
        &self,
        entity_key: &str,
        op: F,
    ) -> Result<T, PlatformError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, PlatformError>>,
    {
        let mut attempt = 0u32;
        loop {
            self.pace(entity_key).await;

            let outcome = match timeout(self.policy.request_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(PlatformError::Timeout),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_fatal() => {
                    error!(entity = entity_key, %err, "fatal error, not retrying");
                    return Err(err);
                }
                Err(PlatformError::FloodWait { seconds }) => {
                    if !self.flood_budget_allows(entity_key).await {
                        error!(
                            entity = entity_key,
                            seconds, "flood-wait budget exhausted"
                        );
                        return Err(PlatformError::FloodWait { seconds });
                    }
                    warn!(entity = entity_key, seconds, "flood wait, honoring");
                    sleep(Duration::from_secs(seconds)).await;
                }
                Err(err) => {
                    if attempt >= self.policy.max_retries {
                        error!(entity = entity_key, %err, "retry budget exhausted");
                        return Err(err);
                    }
                    let delay = self.policy.delay_for_attempt(attempt);
                    warn!(
                        entity = entity_key,
                        %err,
                        retry = attempt + 1,
                        delay_secs = delay.as_secs_f64(),
                        "transient failure, backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
