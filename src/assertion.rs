//! Pass/fail criteria evaluated once, against the final aggregate of a run.
//!
//! ```rust
//! use horda::assertion::{AssertionSpec, Condition, Scope, Statistic};
//!
//! // failed requests percent <= 1, globally
//! let spec = AssertionSpec::new(
//!     Scope::Global,
//!     Statistic::FailedRequestsPercent,
//!     Condition::Lte(1.0),
//! );
//! assert_eq!(spec.to_string(), "Global: failed requests percent is less than or equal to 1");
//! ```
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    aggregate::{RequestStats, RunAggregate},
    error::ConfigurationError,
};

/// Which requests an assertion looks at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Every request together.
    Global,
    /// Each request name on its own.
    ForAll,
    /// One request name, or every request of a group.
    Details(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Statistic {
    FailedRequestsPercent,
    FailedRequestsCount,
    SuccessfulRequestsPercent,
    TotalRequests,
    /// Milliseconds.
    MeanResponseTime,
    /// Milliseconds.
    MaxResponseTime,
    /// Response time at the given percentile (0 to 100), in milliseconds.
    Percentile(f64),
    RequestsPerSec,
}

impl Statistic {
    /// Observed value; `None` when the statistic has no data.
    fn observe(&self, stats: &RequestStats, agg: &RunAggregate) -> Option<f64> {
        match *self {
            Statistic::FailedRequestsPercent => Some(stats.failed_percent()),
            Statistic::FailedRequestsCount => Some(stats.ko as f64),
            Statistic::SuccessfulRequestsPercent => Some(stats.successful_percent()),
            Statistic::TotalRequests => Some(stats.count() as f64),
            Statistic::MeanResponseTime => stats.mean_ms(),
            Statistic::MaxResponseTime => stats.max_ms(),
            Statistic::Percentile(p) => stats.percentile_ms(p),
            Statistic::RequestsPerSec => Some(stats.requests_per_sec(agg.window())),
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statistic::FailedRequestsPercent => f.write_str("failed requests percent"),
            Statistic::FailedRequestsCount => f.write_str("failed requests count"),
            Statistic::SuccessfulRequestsPercent => f.write_str("successful requests percent"),
            Statistic::TotalRequests => f.write_str("total requests"),
            Statistic::MeanResponseTime => f.write_str("mean response time"),
            Statistic::MaxResponseTime => f.write_str("max response time"),
            Statistic::Percentile(p) => write!(f, "{p}th percentile of response time"),
            Statistic::RequestsPerSec => f.write_str("requests per second"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Lt(f64),
    Lte(f64),
    Gt(f64),
    Gte(f64),
    Is(f64),
    /// Inclusive on both ends.
    Between { min: f64, max: f64 },
}

impl Condition {
    pub fn holds(&self, value: f64) -> bool {
        match *self {
            Condition::Lt(t) => value < t,
            Condition::Lte(t) => value <= t,
            Condition::Gt(t) => value > t,
            Condition::Gte(t) => value >= t,
            Condition::Is(t) => value == t,
            Condition::Between { min, max } => min <= value && value <= max,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Lt(t) => write!(f, "is less than {t}"),
            Condition::Lte(t) => write!(f, "is less than or equal to {t}"),
            Condition::Gt(t) => write!(f, "is greater than {t}"),
            Condition::Gte(t) => write!(f, "is greater than or equal to {t}"),
            Condition::Is(t) => write!(f, "is {t}"),
            Condition::Between { min, max } => write!(f, "is between {min} and {max}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionSpec {
    pub scope: Scope,
    pub statistic: Statistic,
    pub condition: Condition,
}

impl AssertionSpec {
    pub fn new(scope: Scope, statistic: Statistic, condition: Condition) -> Self {
        Self {
            scope,
            statistic,
            condition,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if let Statistic::Percentile(p) = self.statistic {
            if !(0.0..=100.0).contains(&p) {
                return Err(ConfigurationError::Assertion(format!(
                    "{self}: percentile must be within 0 and 100"
                )));
            }
        }
        let thresholds = match self.condition {
            Condition::Between { min, max } if min > max => {
                return Err(ConfigurationError::Assertion(format!(
                    "{self}: {min} is greater than {max}"
                )));
            }
            Condition::Between { min, max } => vec![min, max],
            Condition::Lt(t)
            | Condition::Lte(t)
            | Condition::Gt(t)
            | Condition::Gte(t)
            | Condition::Is(t) => vec![t],
        };
        if thresholds.iter().any(|t| !t.is_finite()) {
            return Err(ConfigurationError::Assertion(format!(
                "{self}: thresholds must be finite"
            )));
        }
        Ok(())
    }

    fn describe(&self, target: &str) -> String {
        format!("{target}: {} {}", self.statistic, self.condition)
    }

    fn check(&self, target: &str, stats: &RequestStats, agg: &RunAggregate) -> AssertionResult {
        let observed = self.statistic.observe(stats, agg);
        AssertionResult {
            description: self.describe(target),
            target: target.to_string(),
            observed,
            condition: self.condition,
            passed: observed.is_some_and(|v| self.condition.holds(v)),
        }
    }
}

impl fmt::Display for AssertionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.scope {
            Scope::Global => "Global",
            Scope::ForAll => "For all requests",
            Scope::Details(name) => name.as_str(),
        };
        f.write_str(&self.describe(target))
    }
}

/// Outcome of one assertion on one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub description: String,
    /// `Global`, or the request (or group) name.
    pub target: String,
    pub observed: Option<f64>,
    /// The threshold the observed value was held against.
    pub condition: Condition,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Passed,
    Failed,
    /// No assertion was declared.
    NotEvaluated,
}

impl Verdict {
    pub fn of(results: &[AssertionResult]) -> Self {
        if results.is_empty() {
            Verdict::NotEvaluated
        } else if results.iter().all(|r| r.passed) {
            Verdict::Passed
        } else {
            Verdict::Failed
        }
    }

    pub fn is_success(self) -> bool {
        self != Verdict::Failed
    }
}

/// Evaluates every assertion against the final aggregate.
///
/// `ForAll` yields one result per request name, the other scopes one result each.
pub fn evaluate(specs: &[AssertionSpec], agg: &RunAggregate) -> Vec<AssertionResult> {
    let mut results = Vec::new();
    for spec in specs {
        match &spec.scope {
            Scope::Global => results.push(spec.check("Global", &agg.global, agg)),
            Scope::ForAll if agg.requests.is_empty() => {
                results.push(spec.check("For all requests", &RequestStats::default(), agg))
            }
            Scope::ForAll => {
                for (name, stats) in &agg.requests {
                    results.push(spec.check(name, stats, agg));
                }
            }
            Scope::Details(name) => results.push(spec.check(name, &details(name, agg), agg)),
        }
    }
    results
}

/// Stats of the request called `name`, or of every request inside the group `name`.
fn details(name: &str, agg: &RunAggregate) -> RequestStats {
    if let Some(stats) = agg.requests.get(name) {
        return stats.clone();
    }
    let prefix = format!("{name} / ");
    let mut merged = RequestStats::default();
    for (_, stats) in agg.requests.iter().filter(|(k, _)| k.starts_with(&prefix)) {
        merged.merge(stats.clone());
    }
    merged
}
