use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A defect in the simulation definition.
///
/// Configuration errors are the only process-fatal errors: they are raised while
/// building scenarios, profiles and simulations, and [`crate::Simulation::run`]
/// returns them before any virtual user is started.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("scenario name must not be empty")]
    EmptyScenarioName,

    #[error("simulation `{0}` declares no population")]
    NoPopulation(String),

    #[error("invalid template `{template}`: {reason}")]
    Template { template: String, reason: String },

    #[error("invalid regex `{pattern}`: {reason}")]
    Regex { pattern: String, reason: String },

    #[error("invalid injection profile: {0}")]
    Injection(String),

    #[error("invalid assertion: {0}")]
    Assertion(String),

    #[error("invalid step `{step}`: {reason}")]
    Step { step: String, reason: String },

    #[error("field `{field}` is supplied by both feeder `{first}` and feeder `{second}`")]
    DuplicateFeederField {
        field: String,
        first: String,
        second: String,
    },

    #[error("unknown {kind} `{name}`")]
    Unknown { kind: &'static str, name: String },

    #[error("invalid protocol configuration: {0}")]
    Protocol(String),

    #[error("cannot read definition: {0}")]
    Definition(String),
}

/// Failures local to one virtual user.
///
/// They are recorded inside the user's [`crate::RunOutcome`] and never propagated
/// to the injector or to other virtual users.
#[derive(Debug, Clone, PartialEq, PartialOrd, Error, Serialize, Deserialize)]
pub enum UserError {
    #[error("{0}")]
    Request(String),

    #[error("{0}")]
    Validation(String),

    #[error("request timed out after {0:?}")]
    StepTimeout(Duration),

    #[error("feeder `{0}` is exhausted")]
    FeederExhausted(String),

    #[error("virtual user panicked: {0}")]
    Panicked(String),
}

impl UserError {
    /// Name of the error class, used to tag diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            UserError::Request(_) => "RequestError",
            UserError::Validation(_) => "ValidationError",
            UserError::StepTimeout(_) => "StepTimeout",
            UserError::FeederExhausted(_) => "FeederExhausted",
            UserError::Panicked(_) => "Panic",
        }
    }
}

/// Failure reported by a [`crate::protocol::Transport`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

impl From<TransportError> for UserError {
    fn from(value: TransportError) -> Self {
        UserError::Request(value.to_string())
    }
}
