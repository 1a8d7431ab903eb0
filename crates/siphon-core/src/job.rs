use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Lifecycle state of an extraction job.
///
/// ```text
/// PENDING --> RUNNING --> COMPLETED
///    |           |------> FAILED
///    |           '------> CANCELLING --> CANCELLED
///    '-----------------------------------^
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Running,
        JobState::Cancelling,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Cancelling => "cancelling",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether `self -> next` is an edge of the lifecycle.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Cancelled)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Cancelling)
                | (JobState::Cancelling, JobState::Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "running" | "in_progress" => Ok(JobState::Running),
            "cancelling" => Ok(JobState::Cancelling),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            _ => Err(format!("Unknown job state: {}", s)),
        }
    }
}

/// What to extract: the source kind plus opaque parameters for its client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub source: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl JobSpec {
    pub fn new(source: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            source: source.into(),
            params,
        }
    }

    /// SHA-256 over the canonical JSON form, returned as 64-char hex.
    ///
    /// `serde_json` maps keep keys sorted, so two specs that differ only in
    /// key order share a fingerprint.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::json!({
            "source": self.source,
            "params": self.params,
        });
        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// An extraction job as recorded by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub spec: JobSpec,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub cancel_requested: bool,
    pub record_count: u64,
    /// Holder of the execution lease while RUNNING or CANCELLING.
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Job {
    /// A fresh PENDING job.
    pub fn new(spec: JobSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            spec,
            state: JobState::Pending,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            error: None,
            cancel_requested: false,
            record_count: 0,
            worker_id: None,
            lease_expires_at: None,
        }
    }

    /// Whether `worker_id` may take the execution lease at `now`.
    ///
    /// PENDING jobs are always claimable. RUNNING and CANCELLING jobs are
    /// claimable when unowned, already owned by `worker_id`, or when the
    /// holder's lease has expired. Terminal jobs never are.
    pub fn lease_available_to(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Pending => true,
            JobState::Running | JobState::Cancelling => match &self.worker_id {
                None => true,
                Some(owner) if owner == worker_id => true,
                Some(_) => self.lease_expires_at.is_none_or(|expires| expires <= now),
            },
            _ => false,
        }
    }

    /// Take or extend the execution lease. A PENDING job starts RUNNING.
    pub fn take_lease(&mut self, worker_id: &str, ttl: TimeDelta, now: DateTime<Utc>) {
        if self.state == JobState::Pending {
            self.apply(&Transition::to(JobState::Running), now);
        }
        self.worker_id = Some(worker_id.to_string());
        self.lease_expires_at =
            Some(now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC));
    }

    pub fn clear_lease(&mut self) {
        self.worker_id = None;
        self.lease_expires_at = None;
    }

    /// Wall time between start and finish, if both are known.
    pub fn duration(&self) -> Option<TimeDelta> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// True once a cancel has been requested or recorded.
    pub fn cancellation_requested(&self) -> bool {
        self.cancel_requested || self.state == JobState::Cancelling
    }

    /// Apply a validated transition in place.
    ///
    /// Callers must have checked `from`; this only enforces the edge and
    /// fills the state-dependent fields.
    pub fn apply(&mut self, transition: &Transition, now: DateTime<Utc>) {
        let to = transition.to;
        self.state = to;
        self.updated_at = std::cmp::max(now, self.updated_at);

        if to == JobState::Running && self.started_at.is_none() {
            self.started_at = Some(std::cmp::max(now, self.created_at));
        }
        if matches!(to, JobState::Cancelling | JobState::Cancelled) {
            self.cancel_requested = true;
        }
        if to.is_terminal() {
            let floor = self.started_at.unwrap_or(self.created_at);
            self.finished_at = Some(std::cmp::max(now, floor));
            self.clear_lease();
        }
        if to == JobState::Failed {
            self.error = Some(
                transition
                    .error
                    .clone()
                    .unwrap_or_else(|| "Extraction failed".to_string()),
            );
        }
        if let Some(count) = transition.record_count {
            self.record_count = count;
        }
    }
}

/// Target state plus the fields that accompany it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub to: JobState,
    pub error: Option<String>,
    pub record_count: Option<u64>,
}

impl Transition {
    pub fn to(state: JobState) -> Self {
        Self {
            to: state,
            error: None,
            record_count: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_record_count(mut self, count: u64) -> Self {
        self.record_count = Some(count);
        self
    }
}

/// Page-fetch retry policy with exponential backoff.
///
/// Delay schedule with the defaults: 200ms, 400ms, 800ms, ... capped at 5s.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Extra attempts after the first failure.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// No retries at all; the first failure is final.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Calculate delay for a given retry attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        std::cmp::min(delay, self.max_delay)
    }
}
