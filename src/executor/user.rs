//! Virtual users.
//!
//! A [`VirtualUser`] owns one [`Session`] and walks one scenario, strictly in
//! sequence, until it completes, fails, times out or is cancelled. Whatever happens,
//! it produces exactly one [`RunOutcome`]. Panics raised by user callbacks are caught
//! and recorded as failures.
use std::{
    any::Any,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use rand::{SeedableRng, rngs::StdRng};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch::Receiver},
    task::JoinHandle,
    time::Instant,
};
use typed_builder::TypedBuilder;

use super::cancelled;
use crate::{
    check::apply_checks,
    error::UserError,
    feeder::Feeder,
    metric::{OutcomeStatus, RunOutcome, StateEvent, StepRecord, UserState},
    protocol::{HttpResponse, ProtocolExecutor, Request, Transport},
    scenario::{Chain, Scenario, Step},
    session::Session,
};

/// What a virtual user does after a failed request or check.
///
/// There is deliberately no default: every simulation has to pick one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Stop the user at the first failure.
    FailFast,
    /// Keep going; the last failure is the one reported.
    ContinueOnFailure,
}

/// What happens when a population's single-shot feeder runs out of records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Every further user slot records a failed outcome without running.
    #[default]
    FailUser,
    /// The population stops scheduling users.
    StopInjection,
}

enum Flow {
    Continue,
    /// A failure interrupted the current chain.
    Failed,
    /// The user must stop now.
    Exit,
}

/// The per-user rng: reproducible from the run seed and the user id.
pub(crate) fn user_rng(seed: u64, user_id: u64) -> StdRng {
    StdRng::seed_from_u64(seed ^ user_id.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

pub struct VirtualUser<'a, T> {
    scenario: &'a Scenario,
    protocol: &'a ProtocolExecutor<T>,
    failure_mode: FailureMode,
    run_start: Instant,
    shutdown: Receiver<bool>,
    session: Session,
    rng: StdRng,
    start: Duration,
    steps: Vec<StepRecord>,
    events: Vec<StateEvent>,
    last_error: Option<UserError>,
    cancelled: bool,
}

impl<'a, T: Transport> VirtualUser<'a, T> {
    pub fn new(
        scenario: &'a Scenario,
        protocol: &'a ProtocolExecutor<T>,
        failure_mode: FailureMode,
        session: Session,
        rng: StdRng,
        run_start: Instant,
        shutdown: Receiver<bool>,
    ) -> Self {
        Self {
            scenario,
            protocol,
            failure_mode,
            start: run_start.elapsed(),
            run_start,
            shutdown,
            session,
            rng,
            steps: Vec::new(),
            events: Vec::new(),
            last_error: None,
            cancelled: false,
        }
    }

    /// Walks the whole scenario and reports what happened.
    pub async fn run(mut self) -> RunOutcome {
        self.transition(UserState::Running);
        let scenario = self.scenario;
        let walked = AssertUnwindSafe(self.run_chain(scenario.chain(), None, false))
            .catch_unwind()
            .await;

        let status = match walked {
            Ok(_) => self.final_status(),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::warn!("User {} panicked: {message}", self.session.id());
                self.record_failure(UserError::Panicked(message));
                OutcomeStatus::Failed
            }
        };
        self.transition(status.into());
        // A user that recovered, or was marked succeeded, reports no failure.
        let failure = self.last_error.take().filter(|_| status != OutcomeStatus::Completed);

        RunOutcome {
            user_id: self.session.id(),
            scenario: self.scenario.name().to_string(),
            start: self.start,
            end: self.offset(),
            steps: self.steps,
            events: self.events,
            status,
            failure,
        }
    }

    fn run_chain<'s>(
        &'s mut self,
        chain: &'s Chain,
        group: Option<&'s str>,
        in_try: bool,
    ) -> BoxFuture<'s, Flow> {
        async move {
            for step in chain.steps() {
                let shutting_down = *self.shutdown.borrow();
                if shutting_down {
                    self.cancelled = true;
                    return Flow::Exit;
                }
                match self.run_step(step, group, in_try).await {
                    Flow::Continue => {}
                    flow => return flow,
                }
                if self.session.exit_requested() {
                    return Flow::Exit;
                }
            }
            Flow::Continue
        }
        .boxed()
    }

    async fn run_step(&mut self, step: &Step, group: Option<&str>, in_try: bool) -> Flow {
        match step {
            Step::Request(request) => self.request(request, group, in_try).await,
            Step::Pause(pause) => {
                let duration = pause.duration(&mut self.rng);
                self.pause(duration).await
            }
            Step::Transform(transform) => {
                let placeholder = Session::new(self.session.id(), self.scenario.name());
                let session = std::mem::replace(&mut self.session, placeholder);
                self.session = transform(session);
                Flow::Continue
            }
            Step::Group { name, chain } => {
                let path = match group {
                    Some(outer) => format!("{outer} / {name}"),
                    None => name.clone(),
                };
                self.run_chain(chain, Some(&path), in_try).await
            }
            Step::If { condition, then } => {
                if condition(&self.session) {
                    self.run_chain(then, group, in_try).await
                } else {
                    Flow::Continue
                }
            }
            Step::Repeat {
                times,
                counter,
                chain,
            } => {
                for i in 0..*times {
                    if let Some(counter) = counter {
                        self.session.insert(counter.clone(), i);
                    }
                    match self.run_chain(chain, group, in_try).await {
                        Flow::Continue => {}
                        flow => return flow,
                    }
                }
                if let Some(counter) = counter {
                    self.session.remove(counter);
                }
                Flow::Continue
            }
            Step::TryMax { times, chain } => {
                let failed_before = self.session.is_failed();
                let error_before = self.last_error.clone();
                for attempt in 1..=*times {
                    match self.run_chain(chain, group, true).await {
                        Flow::Continue => {
                            self.last_error = error_before;
                            return Flow::Continue;
                        }
                        Flow::Exit => return Flow::Exit,
                        Flow::Failed if attempt < *times => {
                            tracing::debug!(
                                "User {} retrying after attempt {attempt}/{times}",
                                self.session.id()
                            );
                            if !failed_before {
                                self.session.mark_succeeded();
                            }
                        }
                        Flow::Failed => {}
                    }
                }
                self.escalate(in_try)
            }
            Step::Feed(feeder) => self.feed(feeder),
            Step::ExitHereIfFailed => {
                if self.session.is_failed() {
                    Flow::Exit
                } else {
                    Flow::Continue
                }
            }
        }
    }

    async fn request(&mut self, request: &Request, group: Option<&str>, in_try: bool) -> Flow {
        let start = self.offset();
        let timeout = self.protocol.timeout_for(request);
        let http = match self.protocol.prepare(request, &self.session, &mut self.rng) {
            Ok(http) => http,
            Err(error) => {
                self.record_step(request.name(), group, start, None, Some(&error));
                self.record_failure(error);
                return self.escalate(in_try);
            }
        };
        let url = http.url.clone();

        let protocol = self.protocol;
        let exchange = tokio::select! {
            exchange = protocol.send(http, timeout) => exchange,
            _ = cancelled(&mut self.shutdown) => {
                self.cancelled = true;
                return Flow::Exit;
            }
        };

        let checked = match exchange.result {
            Ok(response) => {
                let checked = apply_checks(
                    request.check_list(),
                    &response,
                    exchange.latency,
                    &mut self.session,
                );
                self.record_step(
                    request.name(),
                    group,
                    start,
                    Some(exchange.latency),
                    checked.as_ref().err(),
                );
                if let Flow::Exit = self.resources(&url, &response, timeout, group).await {
                    return Flow::Exit;
                }
                checked
            }
            Err(error) => {
                self.record_step(request.name(), group, start, Some(exchange.latency), Some(&error));
                Err(error)
            }
        };

        match checked {
            Ok(()) => Flow::Continue,
            Err(error) => {
                tracing::debug!(
                    "User {} failed `{}`: {error}",
                    self.session.id(),
                    request.name()
                );
                self.record_failure(error);
                self.escalate(in_try)
            }
        }
    }

    /// Fetches inferred page resources. Their failures are recorded but never fail the user.
    async fn resources(
        &mut self,
        page_url: &str,
        page: &HttpResponse,
        timeout: Duration,
        group: Option<&str>,
    ) -> Flow {
        let start = self.offset();
        let protocol = self.protocol;
        let fetched = tokio::select! {
            fetched = protocol.fetch_resources(page_url, page, timeout) => fetched,
            _ = cancelled(&mut self.shutdown) => {
                self.cancelled = true;
                return Flow::Exit;
            }
        };
        for (url, exchange) in fetched {
            let error = match exchange.result {
                Ok(response) if response.status < 400 => None,
                Ok(response) => Some(UserError::Request(format!(
                    "resource answered with status {}",
                    response.status
                ))),
                Err(error) => Some(error),
            };
            self.record_step(&url, group, start, Some(exchange.latency), error.as_ref());
        }
        Flow::Continue
    }

    async fn pause(&mut self, duration: Duration) -> Flow {
        self.transition(UserState::Paused);
        tokio::select! {
            _ = tokio::time::sleep(duration) => {
                self.transition(UserState::Running);
                Flow::Continue
            }
            _ = cancelled(&mut self.shutdown) => {
                self.cancelled = true;
                Flow::Exit
            }
        }
    }

    fn feed(&mut self, feeder: &Feeder) -> Flow {
        match feeder.next_record() {
            Ok(record) => {
                self.session.feed(record);
                Flow::Continue
            }
            Err(_) => {
                tracing::warn!(
                    "User {} stopped: feeder `{}` is exhausted",
                    self.session.id(),
                    feeder.name()
                );
                self.record_failure(UserError::FeederExhausted(feeder.name().to_string()));
                Flow::Exit
            }
        }
    }

    fn escalate(&self, in_try: bool) -> Flow {
        if in_try || self.failure_mode == FailureMode::FailFast {
            Flow::Failed
        } else {
            Flow::Continue
        }
    }

    fn record_failure(&mut self, error: UserError) {
        self.session.mark_failed();
        self.last_error = Some(error);
    }

    fn record_step(
        &mut self,
        name: &str,
        group: Option<&str>,
        start: Duration,
        latency: Option<Duration>,
        error: Option<&UserError>,
    ) {
        self.steps.push(StepRecord {
            name: name.to_string(),
            group: group.map(str::to_string),
            start,
            latency,
            ok: error.is_none(),
            error: error.cloned(),
        });
    }

    fn transition(&mut self, state: UserState) {
        tracing::debug!("User {} is {state:?}", self.session.id());
        let at = self.offset();
        self.events.push(StateEvent { state, at });
    }

    fn final_status(&self) -> OutcomeStatus {
        if self.cancelled {
            OutcomeStatus::Cancelled
        } else if self.session.is_failed() {
            match self.last_error {
                Some(UserError::StepTimeout(_)) => OutcomeStatus::TimedOut,
                _ => OutcomeStatus::Failed,
            }
        } else {
            OutcomeStatus::Completed
        }
    }

    fn offset(&self) -> Duration {
        self.run_start.elapsed()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Result of one [`Launcher::launch`] call.
#[derive(Debug)]
pub enum Launch {
    /// A virtual user is running on the returned task.
    Started(JoinHandle<()>),
    /// The population feeder is exhausted; a failed outcome was recorded for this slot.
    Rejected,
    /// The population feeder is exhausted and the population must stop scheduling.
    Stopped,
}

/// Starts the virtual users of one population.
///
/// Every started user draws the next population feeder record, gets the next
/// run-wide id and sends its outcome to the aggregator through `outcomes`.
#[derive(TypedBuilder)]
pub struct Launcher<T> {
    scenario: Arc<Scenario>,
    protocol: Arc<ProtocolExecutor<T>>,
    failure_mode: FailureMode,
    #[builder(default)]
    feeder: Option<Arc<Feeder>>,
    #[builder(default)]
    exhaustion: ExhaustionPolicy,
    seed: u64,
    run_start: Instant,
    /// Shared by every population of a run so that ids are unique run-wide.
    #[builder(default = Arc::new(AtomicU64::new(0)))]
    ids: Arc<AtomicU64>,
    outcomes: mpsc::Sender<RunOutcome>,
    shutdown: Receiver<bool>,
}

impl<T: Transport> Launcher<T> {
    pub fn scenario(&self) -> &Scenario {
        &self.scenario
    }

    pub fn launch(&self) -> Launch {
        let record = match &self.feeder {
            None => None,
            Some(feeder) => match feeder.next_record() {
                Ok(record) => Some(record),
                Err(_) => return self.exhausted(feeder),
            },
        };
        let id = self.next_id();

        let scenario = self.scenario.clone();
        let protocol = self.protocol.clone();
        let outcomes = self.outcomes.clone();
        let shutdown = self.shutdown.clone();
        let failure_mode = self.failure_mode;
        let run_start = self.run_start;
        let rng = user_rng(self.seed, id);

        Launch::Started(tokio::spawn(async move {
            let mut session = Session::new(id, scenario.name());
            if let Some(record) = record {
                session.feed(record);
            }
            let user = VirtualUser::new(
                &scenario,
                &protocol,
                failure_mode,
                session,
                rng,
                run_start,
                shutdown,
            );
            let outcome = user.run().await;
            if outcomes.send(outcome).await.is_err() {
                tracing::error!("Outcome of user {id} lost: the aggregator is gone");
            }
        }))
    }

    fn exhausted(&self, feeder: &Feeder) -> Launch {
        match self.exhaustion {
            ExhaustionPolicy::StopInjection => {
                tracing::info!(
                    "Feeder `{}` is exhausted, stopping injection of `{}`",
                    feeder.name(),
                    self.scenario.name()
                );
                Launch::Stopped
            }
            ExhaustionPolicy::FailUser => {
                let id = self.next_id();
                tracing::warn!("User {id} not started: feeder `{}` is exhausted", feeder.name());
                let outcome = RunOutcome::not_started(
                    id,
                    self.scenario.name(),
                    self.run_start.elapsed(),
                    UserError::FeederExhausted(feeder.name().to_string()),
                );
                let outcomes = self.outcomes.clone();
                tokio::spawn(async move {
                    if outcomes.send(outcome).await.is_err() {
                        tracing::error!("Outcome of user {id} lost: the aggregator is gone");
                    }
                });
                Launch::Rejected
            }
        }
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }
}
