//! Simulation: the glue between populations, protocol, assertions and run options.
//!
//! [`Simulation::run`] validates everything first. Only then does it spawn one
//! aggregator task, one injector task per population and, through the injectors,
//! one task per virtual user. The run is over when every injector is done and every
//! started user has reported its outcome.
use std::{
    sync::{Arc, atomic::AtomicU64},
    time::Duration,
};

use futures::future::join_all;
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use typed_builder::TypedBuilder;

use crate::{
    Aggregate,
    aggregate::{RunAggregate, aggregator_task},
    assertion::{AssertionSpec, evaluate},
    error::ConfigurationError,
    executor::{
        ClosedInjector, ClosedProfile, ExhaustionPolicy, FailureMode, InjectionProfile, Injector,
        Launcher, OpenInjector, cancelled,
    },
    feeder::Feeder,
    protocol::{HttpProtocol, ProtocolExecutor, Transport},
    report::RunReport,
    scenario::{Scenario, check_feeder_fields},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Injection {
    Open(InjectionProfile),
    Closed(ClosedProfile),
}

/// A scenario together with the way its users are injected.
#[derive(Debug, Clone)]
pub struct Population {
    pub scenario: Arc<Scenario>,
    pub injection: Injection,
    /// Drawn once for every user start.
    pub feeder: Option<Arc<Feeder>>,
}

impl Population {
    pub fn open(scenario: impl Into<Arc<Scenario>>, profile: InjectionProfile) -> Self {
        Self {
            scenario: scenario.into(),
            injection: Injection::Open(profile),
            feeder: None,
        }
    }

    pub fn closed(scenario: impl Into<Arc<Scenario>>, profile: ClosedProfile) -> Self {
        Self {
            scenario: scenario.into(),
            injection: Injection::Closed(profile),
            feeder: None,
        }
    }

    pub fn feeder(mut self, feeder: Arc<Feeder>) -> Self {
        self.feeder = Some(feeder);
        self
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let mut feeders: Vec<Arc<Feeder>> = self.feeder.iter().cloned().collect();
        feeders.extend(self.scenario.feeders());
        check_feeder_fields(&feeders)
    }
}

/// A complete load test.
///
/// # Example
/// ```rust, no_run
/// use std::time::Duration;
/// use horda::{
///     check::Check,
///     executor::{FailureMode, InjectionProfile, Phase},
///     protocol::{HttpProtocol, Request, ReqwestTransport},
///     scenario::{Chain, Scenario},
///     simulation::{Population, Simulation},
/// };
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let protocol = HttpProtocol::builder().base_url("http://localhost:8080").build();
/// let scenario = Scenario::new(
///     "Load test greeting",
///     Chain::new().exec(Request::get("get greeting", "/greet/${uuid()}").check(Check::status().is(200))),
/// )?;
/// let report = Simulation::builder()
///     .name("greetings")
///     .transport(ReqwestTransport::new(&protocol)?)
///     .protocol(protocol)
///     .populations(vec![Population::open(
///         scenario,
///         InjectionProfile::new(vec![Phase::ConstantUsersPerSec {
///             rate: 10.0,
///             during: Duration::from_secs(30),
///         }])?,
///     )])
///     .failure_mode(FailureMode::FailFast)
///     .build()
///     .run()
///     .await?;
/// println!("{:?}", report.verdict);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, TypedBuilder)]
pub struct Simulation<T> {
    #[builder(setter(into))]
    pub name: String,
    #[builder(default)]
    pub protocol: HttpProtocol,
    pub transport: T,
    pub populations: Vec<Population>,
    #[builder(default)]
    pub assertions: Vec<AssertionSpec>,
    /// No default: every simulation picks one.
    pub failure_mode: FailureMode,
    /// Seed of every user's rng. Drawn at random when absent.
    #[builder(default, setter(strip_option))]
    pub seed: Option<u64>,
    /// Cancels the run once elapsed.
    #[builder(default, setter(strip_option))]
    pub max_duration: Option<Duration>,
    #[builder(default)]
    pub exhaustion: ExhaustionPolicy,
    /// Granularity of the injectors.
    #[builder(default = Duration::from_millis(10))]
    pub tick: Duration,
    /// Capacity of the outcome channel, and largest batch the aggregator folds at once.
    #[builder(default = 1024)]
    pub batch_size: usize,
}

impl<T: Transport> Simulation<T> {
    /// Checks the whole simulation without running anything.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.populations.is_empty() {
            return Err(ConfigurationError::NoPopulation(self.name.clone()));
        }
        for population in &self.populations {
            population.validate()?;
        }
        for assertion in &self.assertions {
            assertion.validate()?;
        }
        if self.tick.is_zero() || self.batch_size == 0 {
            return Err(ConfigurationError::Injection(
                "tick and batch size must not be zero".to_string(),
            ));
        }
        self.protocol.validate()
    }

    /// Runs the simulation to completion, or until `max_duration` elapses.
    pub async fn run(self) -> Result<RunReport, ConfigurationError> {
        let (_cancel, never) = watch::channel(false);
        self.run_until(never).await
    }

    /// Like [`Simulation::run`], but also cancels the run when `cancel` becomes `true`.
    ///
    /// Cancelled users stop at their next suspension point and are reported as
    /// `Cancelled`; the report is still produced.
    pub async fn run_until(
        self,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<RunReport, ConfigurationError> {
        self.validate()?;
        let Simulation {
            name,
            protocol,
            transport,
            populations,
            assertions,
            failure_mode,
            seed,
            max_duration,
            exhaustion,
            tick,
            batch_size,
        } = self;

        let protocol = Arc::new(ProtocolExecutor::new(protocol, transport)?);
        let seed = seed.unwrap_or_else(rand::random);
        tracing::info!("Running simulation `{name}` with seed {seed}...");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outcomes_tx, outcomes_rx) = mpsc::channel(batch_size);
        tracing::info!("Spawning aggregator task...");
        let aggregator = tokio::spawn(aggregator_task::<RunAggregate>(outcomes_rx, batch_size));

        let run_start = Instant::now();
        let ids = Arc::new(AtomicU64::new(0));
        tracing::info!("Spawning {} injectors...", populations.len());
        let injectors: Vec<_> = populations
            .into_iter()
            .map(|population| {
                let launcher = Arc::new(
                    Launcher::builder()
                        .scenario(population.scenario)
                        .protocol(protocol.clone())
                        .failure_mode(failure_mode)
                        .feeder(population.feeder)
                        .exhaustion(exhaustion)
                        .seed(seed)
                        .run_start(run_start)
                        .ids(ids.clone())
                        .outcomes(outcomes_tx.clone())
                        .shutdown(shutdown_rx.clone())
                        .build(),
                );
                let shutdown = shutdown_rx.clone();
                match population.injection {
                    Injection::Open(profile) => {
                        let injector = OpenInjector::builder().profile(profile).tick(tick).build();
                        tokio::spawn(async move { injector.inject(launcher, shutdown).await })
                    }
                    Injection::Closed(profile) => {
                        let injector = ClosedInjector::builder().profile(profile).tick(tick).build();
                        tokio::spawn(async move { injector.inject(launcher, shutdown).await })
                    }
                }
            })
            .collect();
        // Only launchers and running users may keep the aggregator alive now.
        drop(outcomes_tx);

        let watchdog = tokio::spawn(async move {
            let deadline = async {
                match max_duration {
                    Some(max) => tokio::time::sleep_until(run_start + max).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = deadline => tracing::info!("Maximum duration reached, cancelling the run..."),
                _ = cancelled(&mut cancel) => tracing::info!("Cancellation requested, stopping the run..."),
            }
            let _ = shutdown_tx.send(true);
            // Keep the signal up until the run is over.
            std::future::pending::<()>().await;
        });

        let launched: u64 = join_all(injectors)
            .await
            .into_iter()
            .map(|res| match res {
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("Injector panicked with error: {e}");
                    0
                }
            })
            .sum();
        tracing::info!("Injection done after {launched} users, waiting for running users...");

        let aggregate = match aggregator.await {
            Ok(agg) => agg,
            Err(e) => {
                tracing::error!("Aggregator panicked with error: {e}");
                RunAggregate::new()
            }
        };
        watchdog.abort();

        tracing::info!("Processing results...");
        let results = evaluate(&assertions, &aggregate);
        let report = RunReport::from(aggregate)
            .named(name.as_str())
            .with_assertions(results);
        tracing::info!("Done running simulation `{name}`: {:?}", report.verdict);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::TransportError,
        executor::Phase,
        feeder::{FeedStrategy, Record},
        protocol::{HttpRequest, HttpResponse, Request},
        scenario::Chain,
    };
    use serde_json::json;

    struct Unreachable;

    impl Transport for Unreachable {
        async fn send(&self, _: HttpRequest) -> Result<HttpResponse, TransportError> {
            Err(TransportError::Connect("refused".to_string()))
        }
    }

    fn scenario(chain: Chain) -> Scenario {
        Scenario::new("s", chain).unwrap()
    }

    fn at_once(n: u64) -> InjectionProfile {
        InjectionProfile::new(vec![Phase::AtOnceUsers(n)]).unwrap()
    }

    #[tokio::test]
    async fn refuses_to_run_without_population() {
        let result = Simulation::builder()
            .name("empty")
            .transport(Unreachable)
            .populations(vec![])
            .failure_mode(FailureMode::FailFast)
            .build()
            .run()
            .await;
        assert_eq!(
            result.unwrap_err(),
            ConfigurationError::NoPopulation("empty".to_string())
        );
    }

    #[tokio::test]
    async fn refuses_overlapping_population_feeders() {
        let names = |name: &str| {
            Arc::new(Feeder::new(
                name,
                vec![Record::from([("name".to_string(), json!("ana"))])],
                FeedStrategy::Circular,
            ))
        };
        let population = Population::open(
            scenario(Chain::new().feed(names("inner"))),
            at_once(1),
        )
        .feeder(names("outer"));

        let result = Simulation::builder()
            .name("dup")
            .transport(Unreachable)
            .populations(vec![population])
            .failure_mode(FailureMode::FailFast)
            .build()
            .run()
            .await;
        assert!(matches!(
            result,
            Err(ConfigurationError::DuplicateFeederField { .. })
        ));
    }

    #[tokio::test]
    async fn transport_failures_are_recorded_not_raised() {
        let protocol = HttpProtocol::builder().base_url("http://localhost:1").build();
        let report = Simulation::builder()
            .name("down")
            .protocol(protocol)
            .transport(Unreachable)
            .populations(vec![Population::open(
                scenario(Chain::new().exec(Request::get("home", "/"))),
                at_once(3),
            )])
            .failure_mode(FailureMode::FailFast)
            .seed(7)
            .build()
            .run()
            .await
            .unwrap();

        assert_eq!(report.users.total, 3);
        assert_eq!(report.users.failed, 3);
        assert_eq!(report.global.ko, 3);
        assert_eq!(
            report.errors[0].error,
            "RequestError: connection failed: refused"
        );
    }
}
