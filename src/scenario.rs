//! Scenario graph: the immutable blueprint every virtual user walks through.
//!
//! A [`Chain`] is an ordered sequence of [`Step`]s built by consuming combinators;
//! chains concatenate with [`Chain::then`] and nest through groups, conditionals,
//! loops and retry wrappers. A [`Scenario`] names a chain and validates it once.
//! After that it is shared read-only (behind an `Arc`) by every virtual user.
//!
//! Callbacks are plain function pointers, so a step carries no captured state and
//! cannot observe anything but the session it is handed.
//!
//! ```rust
//! use std::time::Duration;
//! use horda::{check::Check, protocol::Request, scenario::{Chain, Scenario}};
//!
//! let greeting = Chain::new()
//!     .exec(Request::get("get greeting", "/greet/${uuid()}").check(Check::status().is(200)))
//!     .pause(Duration::from_secs(5));
//! let slow_call = Chain::new()
//!     .exec(Request::get("Randomly slow", "/slow").check(Check::status().is(200)));
//!
//! let scenario = Scenario::new("Load test greeting", greeting.then(slow_call)).unwrap();
//! assert_eq!(scenario.chain().len(), 3);
//! ```
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use rand::Rng;

use crate::{
    error::ConfigurationError,
    feeder::Feeder,
    protocol::Request,
    session::Session,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Pause {
    Fixed(Duration),
    /// Uniformly distributed in `min..=max`.
    Uniform { min: Duration, max: Duration },
}

impl Pause {
    pub fn duration<R: Rng>(&self, rng: &mut R) -> Duration {
        match *self {
            Pause::Fixed(d) => d,
            Pause::Uniform { min, max } if min >= max => min,
            Pause::Uniform { min, max } => {
                Duration::from_secs_f64(rng.random_range(min.as_secs_f64()..=max.as_secs_f64()))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum Step {
    Request(Request),
    Pause(Pause),
    /// A pure session transform.
    Transform(fn(Session) -> Session),
    /// A named sub-sequence; its requests are reported as `group / request`.
    Group { name: String, chain: Chain },
    /// Runs `then` only when `condition` holds for the user's session.
    If {
        condition: fn(&Session) -> bool,
        then: Chain,
    },
    /// Runs `chain` `times` times, storing the 0-based iteration under `counter`.
    Repeat {
        times: u32,
        counter: Option<String>,
        chain: Chain,
    },
    /// Runs `chain` until it succeeds, at most `times` times.
    TryMax { times: u32, chain: Chain },
    /// Draws one record from the feeder into the session.
    Feed(Arc<Feeder>),
    /// Stops the user here when its session is marked as failed.
    ExitHereIfFailed,
}

#[derive(Debug, Clone, Default)]
pub struct Chain {
    steps: Vec<Step>,
}

impl From<Vec<Step>> for Chain {
    fn from(steps: Vec<Step>) -> Self {
        Self { steps }
    }
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn exec(self, request: Request) -> Self {
        self.step(Step::Request(request))
    }

    pub fn pause(self, duration: Duration) -> Self {
        self.step(Step::Pause(Pause::Fixed(duration)))
    }

    pub fn pause_between(self, min: Duration, max: Duration) -> Self {
        self.step(Step::Pause(Pause::Uniform { min, max }))
    }

    pub fn transform(self, transform: fn(Session) -> Session) -> Self {
        self.step(Step::Transform(transform))
    }

    pub fn group(self, name: impl Into<String>, chain: Chain) -> Self {
        self.step(Step::Group {
            name: name.into(),
            chain,
        })
    }

    pub fn do_if(self, condition: fn(&Session) -> bool, then: Chain) -> Self {
        self.step(Step::If { condition, then })
    }

    pub fn repeat(self, times: u32, counter: Option<&str>, chain: Chain) -> Self {
        self.step(Step::Repeat {
            times,
            counter: counter.map(str::to_string),
            chain,
        })
    }

    pub fn try_max(self, times: u32, chain: Chain) -> Self {
        self.step(Step::TryMax { times, chain })
    }

    pub fn feed(self, feeder: Arc<Feeder>) -> Self {
        self.step(Step::Feed(feeder))
    }

    pub fn exit_here_if_failed(self) -> Self {
        self.step(Step::ExitHereIfFailed)
    }

    /// Concatenates `other` after this chain.
    pub fn then(mut self, other: Chain) -> Self {
        self.steps.extend(other.steps);
        self
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Debug)]
pub struct Scenario {
    name: String,
    chain: Chain,
}

impl Scenario {
    /// Validates `chain` and wraps it into a named scenario.
    pub fn new(name: impl Into<String>, chain: Chain) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigurationError::EmptyScenarioName);
        }
        validate_chain(&chain)?;
        let scenario = Self { name, chain };
        check_feeder_fields(&scenario.feeders())?;
        Ok(scenario)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Every distinct feeder drawn from by a `Feed` step, in first-use order.
    pub fn feeders(&self) -> Vec<Arc<Feeder>> {
        let mut feeders = Vec::new();
        collect_feeders(&self.chain, &mut feeders);
        feeders
    }
}

fn collect_feeders(chain: &Chain, out: &mut Vec<Arc<Feeder>>) {
    for step in chain.steps() {
        match step {
            Step::Feed(feeder) => {
                if !out.iter().any(|f| Arc::ptr_eq(f, feeder)) {
                    out.push(feeder.clone());
                }
            }
            Step::Group { chain, .. }
            | Step::If { then: chain, .. }
            | Step::Repeat { chain, .. }
            | Step::TryMax { chain, .. } => collect_feeders(chain, out),
            Step::Request(_) | Step::Pause(_) | Step::Transform(_) | Step::ExitHereIfFailed => {}
        }
    }
}

fn validate_chain(chain: &Chain) -> Result<(), ConfigurationError> {
    for step in chain.steps() {
        match step {
            Step::Request(request) => {
                if request.name().trim().is_empty() {
                    return Err(ConfigurationError::Step {
                        step: request.path().source().to_string(),
                        reason: "requests must be named".to_string(),
                    });
                }
                for template in request.templates() {
                    template.validate()?;
                }
            }
            Step::Pause(Pause::Uniform { min, max }) if min > max => {
                return Err(ConfigurationError::Step {
                    step: "pause".to_string(),
                    reason: format!("minimum {min:?} is greater than maximum {max:?}"),
                });
            }
            Step::Group { name, chain } => {
                if name.trim().is_empty() {
                    return Err(ConfigurationError::Step {
                        step: "group".to_string(),
                        reason: "groups must be named".to_string(),
                    });
                }
                validate_chain(chain)?;
            }
            Step::Repeat { times: 0, .. } => {
                return Err(ConfigurationError::Step {
                    step: "repeat".to_string(),
                    reason: "must repeat at least once".to_string(),
                });
            }
            Step::TryMax { times: 0, .. } => {
                return Err(ConfigurationError::Step {
                    step: "tryMax".to_string(),
                    reason: "must try at least once".to_string(),
                });
            }
            Step::If { then: chain, .. }
            | Step::Repeat { chain, .. }
            | Step::TryMax { chain, .. } => validate_chain(chain)?,
            Step::Pause(_) | Step::Transform(_) | Step::Feed(_) | Step::ExitHereIfFailed => {}
        }
    }
    Ok(())
}

/// Rejects feeders that would both write the same session attribute.
pub(crate) fn check_feeder_fields(feeders: &[Arc<Feeder>]) -> Result<(), ConfigurationError> {
    let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
    for (i, feeder) in feeders.iter().enumerate() {
        if feeders[..i].iter().any(|f| Arc::ptr_eq(f, feeder)) {
            continue;
        }
        for field in feeder.fields() {
            if let Some(first) = owners.insert(field.as_str(), feeder.name()) {
                return Err(ConfigurationError::DuplicateFeederField {
                    field: field.clone(),
                    first: first.to_string(),
                    second: feeder.name().to_string(),
                });
            }
        }
    }
    Ok(())
}
