//! Declarative simulation definitions.
//!
//! A [`SimulationDefinition`] is the JSON form of a [`Simulation`]. Durations are
//! humantime strings (`"5s"`, `"250ms"`). Header sets and feeders are declared once
//! by name and referenced from the scenarios:
//!
//! ```json
//! {
//!   "name": "greetings",
//!   "protocol": { "base_url": "http://localhost:8080", "accept": "application/json" },
//!   "feeders": { "names": { "strategy": "circular", "records": [{ "name": "ana" }] } },
//!   "scenarios": [{
//!     "name": "Load test greeting",
//!     "feeder": "names",
//!     "steps": [
//!       { "request": { "name": "get greeting", "path": "/greet/${name}",
//!                      "checks": [{ "extract": "status", "validate": { "is": 200 } }] } },
//!       { "pause": "5s" }
//!     ],
//!     "injection": [{ "constant_users_per_sec": { "rate": 10, "during": "30s" } }]
//!   }],
//!   "assertions": [{ "scope": "global", "statistic": "failed_requests_percent",
//!                    "condition": { "lte": 1.0 } }],
//!   "failure_mode": "fail_fast"
//! }
//! ```
//!
//! Conditions and session transforms are plain functions and only exist in the
//! programmatic API.
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use regex::Regex;
use serde::Deserialize;

use crate::{
    assertion::AssertionSpec,
    check::{self, Check, Extractor, Validator},
    error::ConfigurationError,
    executor::{
        ClosedPhase, ClosedProfile, ExhaustionPolicy, FailureMode, InjectionProfile, Phase,
    },
    feeder::{FeedStrategy, Feeder, Record},
    protocol::{Body, HeaderSet, HttpProtocol, Method, Request, ResourceInference, Transport},
    scenario::{Chain, Scenario},
    session::Value,
    simulation::{Population, Simulation},
    template::Template,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationDefinition {
    pub name: String,
    #[serde(default)]
    pub protocol: ProtocolDefinition,
    #[serde(default)]
    pub header_sets: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub feeders: BTreeMap<String, FeederDefinition>,
    pub scenarios: Vec<ScenarioDefinition>,
    #[serde(default)]
    pub assertions: Vec<AssertionSpec>,
    pub failure_mode: FailureMode,
    #[serde(default)]
    pub exhaustion: ExhaustionPolicy,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default, with = "humantime_serde")]
    pub max_duration: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub tick: Option<Duration>,
    /// Directory feeder files are resolved against.
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProtocolDefinition {
    pub base_url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub user_agent: Option<String>,
    pub accept: Option<String>,
    pub accept_encoding: Option<String>,
    pub accept_language: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub request_timeout: Option<Duration>,
    pub max_connections: Option<usize>,
    #[serde(default, with = "humantime_serde")]
    pub acquire_timeout: Option<Duration>,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    pub infer_resources: Option<ResourceDefinition>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceDefinition {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

/// Records are given inline or read from a JSON array file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeederDefinition {
    #[serde(default)]
    pub strategy: FeedStrategy,
    #[serde(default)]
    pub records: Option<Vec<Record>>,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioDefinition {
    pub name: String,
    /// Feeder drawn from once per user start.
    pub feeder: Option<String>,
    pub steps: Vec<StepDefinition>,
    pub injection: Option<Vec<PhaseDefinition>>,
    pub closed_injection: Option<Vec<ClosedPhaseDefinition>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDefinition {
    Request(RequestDefinition),
    #[serde(with = "humantime_serde")]
    Pause(Duration),
    PauseBetween {
        #[serde(with = "humantime_serde")]
        min: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
    Group {
        name: String,
        steps: Vec<StepDefinition>,
    },
    Repeat {
        times: u32,
        counter: Option<String>,
        steps: Vec<StepDefinition>,
    },
    TryMax {
        times: u32,
        steps: Vec<StepDefinition>,
    },
    /// Name of a declared feeder.
    Feed(String),
    ExitHereIfFailed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequestDefinition {
    pub name: String,
    #[serde(default = "default_method")]
    pub method: Method,
    pub path: String,
    pub header_set: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<BodyDefinition>,
    #[serde(default)]
    pub checks: Vec<CheckDefinition>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

fn default_method() -> Method {
    Method::Get
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyDefinition {
    Text(String),
    /// A JSON template; `${...}` expressions are resolved before sending.
    Json(String),
    Form(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckDefinition {
    pub name: Option<String>,
    pub extract: ExtractDefinition,
    pub transform: Option<TransformDefinition>,
    #[serde(default)]
    pub validate: ValidateDefinition,
    pub save_as: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractDefinition {
    Status,
    Header(String),
    Body,
    Regex {
        pattern: String,
        #[serde(default)]
        group: Option<usize>,
    },
    JsonPointer(String),
    ResponseTime,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformDefinition {
    Uppercase,
    Lowercase,
    Trim,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidateDefinition {
    Is(Value),
    Not(Value),
    In(Vec<Value>),
    #[default]
    Exists,
    NotExists,
    Contains(String),
    Lt(f64),
    Gt(f64),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseDefinition {
    AtOnceUsers(u64),
    RampUsers {
        users: u64,
        #[serde(with = "humantime_serde")]
        over: Duration,
    },
    ConstantUsersPerSec {
        rate: f64,
        #[serde(with = "humantime_serde")]
        during: Duration,
    },
    RampUsersPerSec {
        from: f64,
        to: f64,
        #[serde(with = "humantime_serde")]
        during: Duration,
    },
    #[serde(with = "humantime_serde")]
    NothingFor(Duration),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosedPhaseDefinition {
    ConstantConcurrentUsers {
        users: u64,
        #[serde(with = "humantime_serde")]
        during: Duration,
    },
    RampConcurrentUsers {
        from: u64,
        to: u64,
        #[serde(with = "humantime_serde")]
        during: Duration,
    },
}

impl From<&PhaseDefinition> for Phase {
    fn from(value: &PhaseDefinition) -> Self {
        match *value {
            PhaseDefinition::AtOnceUsers(n) => Phase::AtOnceUsers(n),
            PhaseDefinition::RampUsers { users, over } => Phase::RampUsers { users, over },
            PhaseDefinition::ConstantUsersPerSec { rate, during } => {
                Phase::ConstantUsersPerSec { rate, during }
            }
            PhaseDefinition::RampUsersPerSec { from, to, during } => {
                Phase::RampUsersPerSec { from, to, during }
            }
            PhaseDefinition::NothingFor(d) => Phase::NothingFor(d),
        }
    }
}

impl From<&ClosedPhaseDefinition> for ClosedPhase {
    fn from(value: &ClosedPhaseDefinition) -> Self {
        match *value {
            ClosedPhaseDefinition::ConstantConcurrentUsers { users, during } => {
                ClosedPhase::ConstantConcurrentUsers { users, during }
            }
            ClosedPhaseDefinition::RampConcurrentUsers { from, to, during } => {
                ClosedPhase::RampConcurrentUsers { from, to, during }
            }
        }
    }
}

/// Named declarations shared by every scenario of a definition.
struct Catalog {
    header_sets: BTreeMap<String, Arc<HeaderSet>>,
    feeders: BTreeMap<String, Arc<Feeder>>,
}

impl Catalog {
    fn header_set(&self, name: &str) -> Result<Arc<HeaderSet>, ConfigurationError> {
        self.header_sets
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigurationError::Unknown {
                kind: "header set",
                name: name.to_string(),
            })
    }

    fn feeder(&self, name: &str) -> Result<Arc<Feeder>, ConfigurationError> {
        self.feeders
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigurationError::Unknown {
                kind: "feeder",
                name: name.to_string(),
            })
    }
}

impl SimulationDefinition {
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(json).map_err(|e| ConfigurationError::Definition(e.to_string()))
    }

    /// Reads a definition file. Feeder files are resolved relative to its directory.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let json = read(path)?;
        let mut definition = Self::from_json(&json)?;
        definition.base_dir = path.parent().map(Path::to_path_buf);
        Ok(definition)
    }

    /// Builds the protocol configuration, starting from the library defaults.
    pub fn protocol(&self) -> Result<HttpProtocol, ConfigurationError> {
        let def = &self.protocol;
        let mut protocol = HttpProtocol::default();
        protocol.base_url = def.base_url.clone();
        protocol.headers = def
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        protocol.user_agent = def.user_agent.clone();
        protocol.accept = def.accept.clone();
        protocol.accept_encoding = def.accept_encoding.clone();
        protocol.accept_language = def.accept_language.clone();
        if let Some(timeout) = def.request_timeout {
            protocol.request_timeout = timeout;
        }
        if let Some(max) = def.max_connections {
            protocol.max_connections = max;
        }
        if let Some(timeout) = def.acquire_timeout {
            protocol.acquire_timeout = timeout;
        }
        protocol.accept_invalid_certs = def.accept_invalid_certs;
        if let Some(resources) = &def.infer_resources {
            protocol.infer_resources =
                Some(ResourceInference::new(&resources.allow, &resources.deny)?);
        }
        protocol.validate()?;
        Ok(protocol)
    }

    /// Converts the definition into a runnable simulation.
    ///
    /// `transport` builds the network boundary from the final protocol configuration.
    pub fn into_simulation<T, F>(self, transport: F) -> Result<Simulation<T>, ConfigurationError>
    where
        T: Transport,
        F: FnOnce(&HttpProtocol) -> Result<T, ConfigurationError>,
    {
        let protocol = self.protocol()?;
        let catalog = self.catalog()?;

        let populations = self
            .scenarios
            .iter()
            .map(|scenario| scenario.population(&catalog))
            .collect::<Result<Vec<_>, _>>()?;

        let mut simulation = Simulation::builder()
            .name(self.name)
            .transport(transport(&protocol)?)
            .protocol(protocol)
            .populations(populations)
            .assertions(self.assertions)
            .failure_mode(self.failure_mode)
            .exhaustion(self.exhaustion)
            .build();
        simulation.seed = self.seed;
        simulation.max_duration = self.max_duration;
        if let Some(tick) = self.tick {
            simulation.tick = tick;
        }
        simulation.validate()?;
        Ok(simulation)
    }

    fn catalog(&self) -> Result<Catalog, ConfigurationError> {
        let header_sets = self
            .header_sets
            .iter()
            .map(|(name, headers)| (name.clone(), HeaderSet::new(name.as_str(), headers.clone())))
            .collect();

        let mut feeders = BTreeMap::new();
        for (i, (name, def)) in self.feeders.iter().enumerate() {
            let records = match (&def.records, &def.file) {
                (Some(records), None) => records.clone(),
                (None, Some(file)) => self.read_records(file)?,
                _ => {
                    return Err(ConfigurationError::Definition(format!(
                        "feeder `{name}` needs exactly one of `records` and `file`"
                    )));
                }
            };
            let feeder = match self.seed {
                Some(seed) => Feeder::seeded(
                    name.as_str(),
                    records,
                    def.strategy,
                    seed.wrapping_add(i as u64),
                ),
                None => Feeder::new(name.as_str(), records, def.strategy),
            };
            feeders.insert(name.clone(), Arc::new(feeder));
        }

        Ok(Catalog {
            header_sets,
            feeders,
        })
    }

    fn read_records(&self, file: &Path) -> Result<Vec<Record>, ConfigurationError> {
        let path = match &self.base_dir {
            Some(dir) if file.is_relative() => dir.join(file),
            _ => file.to_path_buf(),
        };
        let json = read(&path)?;
        serde_json::from_str(&json).map_err(|e| {
            ConfigurationError::Definition(format!("feeder file `{}`: {e}", path.display()))
        })
    }
}

fn read(path: &Path) -> Result<String, ConfigurationError> {
    std::fs::read_to_string(path)
        .map_err(|e| ConfigurationError::Definition(format!("`{}`: {e}", path.display())))
}

impl ScenarioDefinition {
    fn population(&self, catalog: &Catalog) -> Result<Population, ConfigurationError> {
        let scenario = Scenario::new(self.name.as_str(), build_chain(&self.steps, catalog)?)?;
        let mut population = match (&self.injection, &self.closed_injection) {
            (Some(phases), None) => Population::open(
                scenario,
                InjectionProfile::new(phases.iter().map(Phase::from).collect())?,
            ),
            (None, Some(phases)) => Population::closed(
                scenario,
                ClosedProfile::new(phases.iter().map(ClosedPhase::from).collect())?,
            ),
            _ => {
                return Err(ConfigurationError::Injection(format!(
                    "scenario `{}` needs exactly one of `injection` and `closed_injection`",
                    self.name
                )));
            }
        };
        if let Some(feeder) = &self.feeder {
            population = population.feeder(catalog.feeder(feeder)?);
        }
        Ok(population)
    }
}

fn build_chain(steps: &[StepDefinition], catalog: &Catalog) -> Result<Chain, ConfigurationError> {
    let mut chain = Chain::new();
    for step in steps {
        chain = match step {
            StepDefinition::Request(request) => chain.exec(request.build(catalog)?),
            StepDefinition::Pause(d) => chain.pause(*d),
            StepDefinition::PauseBetween { min, max } => chain.pause_between(*min, *max),
            StepDefinition::Group { name, steps } => {
                chain.group(name.as_str(), build_chain(steps, catalog)?)
            }
            StepDefinition::Repeat {
                times,
                counter,
                steps,
            } => chain.repeat(*times, counter.as_deref(), build_chain(steps, catalog)?),
            StepDefinition::TryMax { times, steps } => {
                chain.try_max(*times, build_chain(steps, catalog)?)
            }
            StepDefinition::Feed(name) => chain.feed(catalog.feeder(name)?),
            StepDefinition::ExitHereIfFailed => chain.exit_here_if_failed(),
        };
    }
    Ok(chain)
}

impl RequestDefinition {
    fn build(&self, catalog: &Catalog) -> Result<Request, ConfigurationError> {
        let mut request = Request::new(
            self.name.as_str(),
            self.method,
            Template::parse(self.path.as_str())?,
        );
        if let Some(set) = &self.header_set {
            request = request.headers(catalog.header_set(set)?);
        }
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), Template::parse(value.as_str())?);
        }
        match &self.body {
            Some(BodyDefinition::Text(text)) => {
                request = request.body(Body::Text(Template::parse(text.as_str())?));
            }
            Some(BodyDefinition::Json(json)) => {
                request = request.body(Body::Json(Template::parse(json.as_str())?));
            }
            Some(BodyDefinition::Form(params)) => {
                for (name, value) in params {
                    request = request.form_param(name.as_str(), Template::parse(value.as_str())?);
                }
            }
            None => {}
        }
        for check in &self.checks {
            request = request.check(check.build()?);
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        Ok(request)
    }
}

impl CheckDefinition {
    fn build(&self) -> Result<Check, ConfigurationError> {
        let extractor = match &self.extract {
            ExtractDefinition::Status => Extractor::Status,
            ExtractDefinition::Header(name) => Extractor::Header(name.clone()),
            ExtractDefinition::Body => Extractor::Body,
            ExtractDefinition::Regex { pattern, group } => {
                let compiled = Regex::new(pattern).map_err(|e| ConfigurationError::Regex {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                })?;
                let group = group.unwrap_or(usize::from(compiled.captures_len() > 1));
                if group >= compiled.captures_len() {
                    return Err(ConfigurationError::Regex {
                        pattern: pattern.clone(),
                        reason: format!("no capture group {group}"),
                    });
                }
                Extractor::Regex {
                    pattern: compiled,
                    group,
                }
            }
            ExtractDefinition::JsonPointer(pointer) => Extractor::JsonPointer(pointer.clone()),
            ExtractDefinition::ResponseTime => Extractor::ResponseTime,
        };

        let validator = match &self.validate {
            ValidateDefinition::Is(v) => Validator::Is(v.clone()),
            ValidateDefinition::Not(v) => Validator::Not(v.clone()),
            ValidateDefinition::In(vs) => Validator::In(vs.clone()),
            ValidateDefinition::Exists => Validator::Exists,
            ValidateDefinition::NotExists => Validator::NotExists,
            ValidateDefinition::Contains(s) => Validator::Contains(s.clone()),
            ValidateDefinition::Lt(n) => Validator::LessThan(*n),
            ValidateDefinition::Gt(n) => Validator::GreaterThan(*n),
        };

        let mut check = Check::new(extractor).validate_with(validator);
        if let Some(transform) = self.transform {
            check = check.transform(match transform {
                TransformDefinition::Uppercase => check::uppercase,
                TransformDefinition::Lowercase => check::lowercase,
                TransformDefinition::Trim => check::trim,
            });
        }
        if let Some(key) = &self.save_as {
            check = check.save_as(key.as_str());
        }
        if let Some(name) = &self.name {
            check = check.name(name.as_str());
        }
        Ok(check)
    }
}
