use std::fmt::Debug;
use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::UserError;

/// A `Metric` is a single observation sent by a virtual user to the aggregator.
///
/// Metrics are collected and summarized by an [`crate::Aggregate`], which the
/// [`crate::report::RunReport`] then analyses. The engine's metric is [`RunOutcome`]:
/// one per virtual user, carrying every request the user made.
///
/// ## Design principles
/// - **Self-contained:** a metric is complete when sent; the aggregator never has to
///   correlate several messages of the same user.
/// - **Serializable:** metrics can be persisted or shipped to another process as-is.
/// - **Thread-safe and clonable:** metrics must be `Send`, `Sync`, and `Clone`.
pub trait Metric
where
    Self: Serialize + DeserializeOwned + PartialOrd + PartialEq + Send + Sync + Debug + Clone,
{
}

/// States a virtual user goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UserState {
    Running,
    Paused,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl UserState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, UserState::Running | UserState::Paused)
    }
}

/// Terminal status of a virtual user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OutcomeStatus {
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl From<OutcomeStatus> for UserState {
    fn from(value: OutcomeStatus) -> Self {
        match value {
            OutcomeStatus::Completed => UserState::Completed,
            OutcomeStatus::Failed => UserState::Failed,
            OutcomeStatus::TimedOut => UserState::TimedOut,
            OutcomeStatus::Cancelled => UserState::Cancelled,
        }
    }
}

/// A timestamped state transition. `at` is the offset from the start of the run.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct StateEvent {
    pub state: UserState,
    pub at: Duration,
}

/// One request (or inferred resource) made by a virtual user.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    /// Enclosing groups, outermost first, joined with ` / `.
    pub group: Option<String>,
    /// Offset from the start of the run.
    pub start: Duration,
    /// `None` when the request could not be sent, e.g. its template did not resolve.
    pub latency: Option<Duration>,
    pub ok: bool,
    pub error: Option<UserError>,
}

impl StepRecord {
    /// Name under which the request is aggregated: `group / name`.
    pub fn key(&self) -> String {
        match &self.group {
            Some(group) => format!("{group} / {}", self.name),
            None => self.name.clone(),
        }
    }
}

/// Everything one virtual user did during the run.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct RunOutcome {
    pub user_id: u64,
    pub scenario: String,
    pub start: Duration,
    pub end: Duration,
    pub steps: Vec<StepRecord>,
    pub events: Vec<StateEvent>,
    pub status: OutcomeStatus,
    /// The last failure the user hit, if any.
    pub failure: Option<UserError>,
}

impl Metric for RunOutcome {}

impl RunOutcome {
    /// Outcome for a user slot that could not start, e.g. on feeder exhaustion.
    pub fn not_started(user_id: u64, scenario: &str, at: Duration, error: UserError) -> Self {
        Self {
            user_id,
            scenario: scenario.to_string(),
            start: at,
            end: at,
            steps: Vec::new(),
            events: vec![StateEvent {
                state: UserState::Failed,
                at,
            }],
            status: OutcomeStatus::Failed,
            failure: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Completed
    }

    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }

    pub fn failed_requests(&self) -> usize {
        self.steps.iter().filter(|s| !s.ok).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_include_groups() {
        let mut record = StepRecord {
            name: "request_1".to_string(),
            group: None,
            start: Duration::ZERO,
            latency: Some(Duration::from_millis(3)),
            ok: true,
            error: None,
        };
        assert_eq!(record.key(), "request_1");
        record.group = Some("browse / search".to_string());
        assert_eq!(record.key(), "browse / search / request_1");
    }

    #[test]
    fn not_started_outcomes_are_failures() {
        let outcome = RunOutcome::not_started(
            4,
            "s",
            Duration::from_secs(1),
            UserError::FeederExhausted("users".into()),
        );
        assert!(!outcome.is_success());
        assert_eq!(outcome.duration(), Duration::ZERO);
        assert_eq!(outcome.events.len(), 1);
        assert!(outcome.events[0].state.is_terminal());
    }
}
