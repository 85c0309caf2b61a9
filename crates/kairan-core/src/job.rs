//! Job records and the status state machine.
//!
//! A job is the only entity the queue knows about. Its `status` moves along
//! a small, closed graph; everything else (ownership, attempts, lease) is
//! bookkeeping that the claim and outcome operations keep consistent.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier assigned to a job at creation.
pub type JobId = uuid::Uuid;

/// Identifier of the user a job is attributed to.
pub type UserId = uuid::Uuid;

/// Field inside `input_data` that carries the producer's idempotency key.
pub const IDEMPOTENCY_KEY_FIELD: &str = "idempotencyKey";

/// Attempt ceiling used when the producer does not choose one.
pub const DEFAULT_MAX_ATTEMPTS: u16 = 3;

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed.
    Pending,
    /// Owned by a worker until its lease expires.
    Processing,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully; may be reset to `Pending` by an operator.
    Failed,
    /// Withdrawn before any worker claimed it.
    Cancelled,
    /// Retry budget exhausted; parked for manual intervention.
    DeadLetter,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::DeadLetter,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::DeadLetter => "dead_letter",
        }
    }

    /// `completed`, `cancelled` and `dead_letter` never change again.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Cancelled | JobStatus::DeadLetter
        )
    }

    /// Whether a store may move a job from `self` to `next`.
    ///
    /// `Processing -> Processing` is the re-claim of a job whose lease
    /// expired; it is the only self-loop.
    pub const fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Pending, Cancelled)
                | (Failed, Pending)
                | (Pending, DeadLetter)
                | (Processing, DeadLetter)
                | (Failed, DeadLetter)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("job status", s))
    }
}

/// Kind of generation work; decides how a handler reads `input_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    PostGeneration,
    NewsletterIntro,
    ContentSummary,
    DocumentSummary,
    AnnouncementDraft,
    PageDraft,
}

impl RequestType {
    pub const ALL: [RequestType; 6] = [
        RequestType::PostGeneration,
        RequestType::NewsletterIntro,
        RequestType::ContentSummary,
        RequestType::DocumentSummary,
        RequestType::AnnouncementDraft,
        RequestType::PageDraft,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            RequestType::PostGeneration => "post_generation",
            RequestType::NewsletterIntro => "newsletter_intro",
            RequestType::ContentSummary => "content_summary",
            RequestType::DocumentSummary => "document_summary",
            RequestType::AnnouncementDraft => "announcement_draft",
            RequestType::PageDraft => "page_draft",
        }
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RequestType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestType::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ParseEnumError::new("request type", s))
    }
}

/// Returned when a stored or user-supplied name matches no variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
}

impl ParseEnumError {
    pub(crate) fn new(what: &'static str, value: &str) -> Self {
        Self {
            what,
            value: value.to_owned(),
        }
    }
}

impl std::fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown {}: {:?}", self.what, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

/// A queued unit of work as persisted by a store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub user_id: Option<UserId>,
    pub request_type: RequestType,
    pub input_data: serde_json::Value,
    pub status: JobStatus,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub attempts: i32,
    pub max_attempts: i32,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Idempotency key embedded in the payload, if any.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.input_data
            .get(IDEMPOTENCY_KEY_FIELD)
            .and_then(serde_json::Value::as_str)
    }

    /// No claim may ever return this job again.
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// `processing` with a lease that ran out before `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.lease_expires_at.is_some_and(|expires| expires < now)
    }

    /// Eligibility rule shared by every claim implementation.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.is_exhausted() && (self.status == JobStatus::Pending || self.lease_expired(now))
    }

    /// `processing` and locked by `worker_id`; lease expiry does not matter.
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.status == JobStatus::Processing && self.locked_by.as_deref() == Some(worker_id)
    }
}

/// Producer request to enqueue a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub user_id: Option<UserId>,
    pub request_type: RequestType,
    pub input_data: serde_json::Map<String, serde_json::Value>,
    /// `None` falls back to the store's configured default.
    pub max_attempts: Option<u16>,
}

impl NewJob {
    pub fn new(
        request_type: RequestType,
        input_data: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            user_id: None,
            request_type,
            input_data,
            max_attempts: None,
        }
    }

    /// Serialize `payload` as the job input. It must serialize to a JSON object.
    pub fn from_payload<T>(request_type: RequestType, payload: &T) -> Result<Self, crate::Error>
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_value(payload).map_err(crate::Error::encode)? {
            serde_json::Value::Object(map) => Ok(Self::new(request_type, map)),
            other => Err(crate::Error::invalid_input(format!(
                "job input must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn with_user(self, user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..self
        }
    }

    pub fn with_max_attempts(self, max_attempts: u16) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..self
        }
    }

    /// Embed `key` under [`IDEMPOTENCY_KEY_FIELD`], replacing any previous key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.input_data.insert(
            IDEMPOTENCY_KEY_FIELD.to_owned(),
            serde_json::Value::String(key.into()),
        );
        self
    }

    pub fn idempotency_key(&self) -> Option<&str> {
        self.input_data
            .get(IDEMPOTENCY_KEY_FIELD)
            .and_then(serde_json::Value::as_str)
    }

    /// Attempt ceiling to persist, rejecting a ceiling of zero.
    pub fn resolve_max_attempts(&self, default: u16) -> Result<i32, crate::Error> {
        match self.max_attempts.unwrap_or(default) {
            0 => Err(crate::Error::invalid_input("max_attempts must be at least 1")),
            n => Ok(i32::from(n)),
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}
