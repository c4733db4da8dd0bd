use std::{collections::BTreeMap, fmt::Debug, time::Duration};

use hdrhistogram::Histogram;
use tokio::sync::mpsc;

use crate::{
    Metric,
    error::UserError,
    metric::{OutcomeStatus, RunOutcome},
};

/// The `Aggregate` trait defines how raw [`Metric`] values are collected and combined
/// into an intermediate, mergeable representation that preserves the information
/// necessary for later analysis.
///
/// **Important:** `Aggregate` implementations should **not** compute final statistics
/// such as averages or percentiles. Those derived values belong in a
/// [`crate::report::Report`], which is converted from an `Aggregate` and performs the
/// final processing. Aggregates store compact, mergeable raw data (counts, histograms,
/// error counters) so that reports and assertions can compute accurate summaries.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative** so that merging order does not
///   affect results.
/// - Aggregates are owned by a single task at a time. Concurrent producers send their
///   metrics over a channel instead of sharing counters (see [`aggregator_task`]).
pub trait Aggregate
where
    Self: Send + Debug + Clone,
{
    /// The metric type this aggregate summarizes.
    type Metric: Metric;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Aggregate multiple metrics into the current instance.
    ///
    /// This default implementation calls [`Aggregate::consume`] for each metric.
    fn aggregate(&mut self, metrics: &[Self::Metric]) {
        metrics.iter().for_each(|m| self.consume(m));
    }

    /// Incorporate a single metric into the aggregate.
    fn consume(&mut self, metric: &Self::Metric);

    /// Combine two different aggregates into one.
    fn merge(&mut self, other: Self);
}

/// Latency histograms track microseconds with 3 significant digits.
const SIGNIFICANT_DIGITS: u8 = 3;

/// Counts and latency distribution of one request name (or of all requests).
#[derive(Debug, Clone, Default)]
pub struct RequestStats {
    pub ok: u64,
    pub ko: u64,
    /// Created on the first recorded latency.
    latencies: Option<Histogram<u64>>,
}

impl RequestStats {
    /// Counts one request. Only requests that were actually sent carry a latency.
    pub fn record(&mut self, ok: bool, latency: Option<Duration>) {
        if ok {
            self.ok += 1;
        } else {
            self.ko += 1;
        }
        let Some(latency) = latency else { return };
        if self.latencies.is_none() {
            self.latencies = Histogram::new(SIGNIFICANT_DIGITS).ok();
        }
        if let Some(histogram) = &mut self.latencies {
            let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
            histogram.saturating_record(micros);
        }
    }

    pub fn count(&self) -> u64 {
        self.ok + self.ko
    }

    /// Recorded latencies, `None` until something was recorded.
    pub fn latencies(&self) -> Option<&Histogram<u64>> {
        self.latencies.as_ref().filter(|h| !h.is_empty())
    }

    pub fn merge(&mut self, other: RequestStats) {
        self.ok += other.ok;
        self.ko += other.ko;
        match (&mut self.latencies, other.latencies) {
            (Some(mine), Some(theirs)) => {
                if let Err(e) = mine.add(&theirs) {
                    tracing::warn!("Dropping latencies that could not be merged: {e}");
                }
            }
            (None, theirs) => self.latencies = theirs,
            (Some(_), None) => {}
        }
    }
}

/// Run-wide fold of every [`RunOutcome`].
#[derive(Debug, Clone, Default)]
pub struct RunAggregate {
    /// Users by terminal status.
    pub users: BTreeMap<OutcomeStatus, u64>,
    /// All requests together.
    pub global: RequestStats,
    /// Requests by `group / name`.
    pub requests: BTreeMap<String, RequestStats>,
    /// Occurrences of each distinct error, keyed by `kind: message`.
    pub errors: BTreeMap<String, u64>,
    /// Earliest user start, as an offset from the start of the run.
    pub first_start: Option<Duration>,
    /// Latest user end, as an offset from the start of the run.
    pub last_end: Option<Duration>,
}

impl RunAggregate {
    pub fn total_users(&self) -> u64 {
        self.users.values().sum()
    }

    pub fn users_with(&self, status: OutcomeStatus) -> u64 {
        self.users.get(&status).copied().unwrap_or(0)
    }

    /// Time between the first user start and the last user end.
    pub fn window(&self) -> Duration {
        match (self.first_start, self.last_end) {
            (Some(start), Some(end)) => end.saturating_sub(start),
            _ => Duration::ZERO,
        }
    }

    fn count_error(&mut self, error: &UserError) {
        *self
            .errors
            .entry(format!("{}: {error}", error.kind()))
            .or_insert(0) += 1;
    }
}

impl Aggregate for RunAggregate {
    type Metric = RunOutcome;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, outcome: &RunOutcome) {
        *self.users.entry(outcome.status).or_insert(0) += 1;
        self.first_start = Some(
            self.first_start
                .map_or(outcome.start, |s| s.min(outcome.start)),
        );
        self.last_end = Some(self.last_end.map_or(outcome.end, |e| e.max(outcome.end)));

        for step in &outcome.steps {
            self.global.record(step.ok, step.latency);
            self.requests
                .entry(step.key())
                .or_default()
                .record(step.ok, step.latency);
            if let Some(error) = &step.error {
                self.count_error(error);
            }
        }
        // Failures that are not tied to a request.
        if let Some(error @ (UserError::FeederExhausted(_) | UserError::Panicked(_))) =
            &outcome.failure
        {
            self.count_error(error);
        }
    }

    fn merge(&mut self, other: Self) {
        for (status, n) in other.users {
            *self.users.entry(status).or_insert(0) += n;
        }
        self.global.merge(other.global);
        for (name, stats) in other.requests {
            self.requests.entry(name).or_default().merge(stats);
        }
        for (error, n) in other.errors {
            *self.errors.entry(error).or_insert(0) += n;
        }
        self.first_start = match (self.first_start, other.first_start) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_end = match (self.last_end, other.last_end) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Tokio task folding every metric received on `rx` into an aggregate.
///
/// Runs until every sender is dropped, then returns the final aggregate.
pub(crate) async fn aggregator_task<A: Aggregate>(
    mut rx: mpsc::Receiver<A::Metric>,
    batch_size: usize,
) -> A {
    let mut agg = A::new();
    let mut batch = Vec::with_capacity(batch_size);

    // Receive the first metric or end the loop if every sender is dropped
    while let Some(metric) = rx.recv().await {
        batch.push(metric);

        // Drain whatever else is already queued
        while batch.len() < batch_size {
            match rx.try_recv() {
                Ok(metric) => batch.push(metric),
                Err(_) => break,
            }
        }

        agg.aggregate(&batch);
        batch.clear();
    }
    tracing::debug!("Aggregator channel closed.");
    agg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::StepRecord;

    fn step(name: &str, ok: bool, latency_ms: u64) -> StepRecord {
        StepRecord {
            name: name.to_string(),
            group: None,
            start: Duration::ZERO,
            latency: Some(Duration::from_millis(latency_ms)),
            ok,
            error: (!ok).then(|| UserError::Validation(format!("{name}: status: found 404"))),
        }
    }

    fn outcome(user_id: u64, steps: Vec<StepRecord>) -> RunOutcome {
        let ok = steps.iter().all(|s| s.ok);
        RunOutcome {
            user_id,
            scenario: "s".to_string(),
            start: Duration::from_secs(user_id),
            end: Duration::from_secs(user_id + 5),
            failure: steps.iter().rev().find_map(|s| s.error.clone()),
            steps,
            events: Vec::new(),
            status: if ok {
                OutcomeStatus::Completed
            } else {
                OutcomeStatus::Failed
            },
        }
    }

    #[test]
    fn consume_counts_requests_and_users() {
        let mut agg = RunAggregate::new();
        agg.consume(&outcome(0, vec![step("a", true, 10), step("b", true, 30)]));
        agg.consume(&outcome(1, vec![step("a", false, 20)]));

        assert_eq!(agg.total_users(), 2);
        assert_eq!(agg.users_with(OutcomeStatus::Completed), 1);
        assert_eq!(agg.users_with(OutcomeStatus::Failed), 1);
        assert_eq!(agg.global.count(), 3);
        assert_eq!(agg.global.ko, 1);
        assert_eq!(agg.requests["a"].count(), 2);
        assert_eq!(agg.requests["b"].ok, 1);
        assert_eq!(agg.errors.values().sum::<u64>(), 1);
        assert_eq!(agg.window(), Duration::from_secs(6));

        let max = agg.global.latencies().unwrap().max();
        assert!((29_900..=30_100).contains(&max));
    }

    #[test]
    fn merge_matches_sequential_consume() {
        let outcomes = [
            outcome(0, vec![step("a", true, 10)]),
            outcome(1, vec![step("a", false, 40), step("b", true, 5)]),
            outcome(2, vec![step("b", true, 7)]),
        ];

        let mut whole = RunAggregate::new();
        whole.aggregate(&outcomes);

        let mut left = RunAggregate::new();
        left.aggregate(&outcomes[..1]);
        let mut right = RunAggregate::new();
        right.aggregate(&outcomes[1..]);
        left.merge(right);

        assert_eq!(left.users, whole.users);
        assert_eq!(left.errors, whole.errors);
        assert_eq!(left.global.count(), whole.global.count());
        assert_eq!(left.first_start, whole.first_start);
        assert_eq!(left.last_end, whole.last_end);
        assert_eq!(
            left.global.latencies().unwrap().len(),
            whole.global.latencies().unwrap().len()
        );
    }

    #[test]
    fn unsent_requests_count_without_latency() {
        let mut unsent = step("a", false, 0);
        unsent.latency = None;
        let mut agg = RunAggregate::new();
        agg.consume(&outcome(0, vec![unsent, step("a", true, 40)]));

        assert_eq!(agg.requests["a"].ko, 1);
        assert_eq!(agg.requests["a"].ok, 1);
        let latencies = agg.requests["a"].latencies().unwrap();
        assert_eq!(latencies.len(), 1);
        assert!(latencies.min() >= 39_000);
    }

    #[test]
    fn empty_stats_have_no_latencies() {
        let agg = RunAggregate::new();
        assert!(agg.global.latencies().is_none());
        assert_eq!(agg.window(), Duration::ZERO);
    }

    #[tokio::test]
    async fn aggregator_task_drains_until_senders_drop() {
        let (tx, rx) = mpsc::channel(4);
        let task = tokio::spawn(aggregator_task::<RunAggregate>(rx, 2));
        for id in 0..10 {
            tx.send(outcome(id, vec![step("a", true, 1)])).await.unwrap();
        }
        drop(tx);
        let agg = task.await.unwrap();
        assert_eq!(agg.total_users(), 10);
        assert_eq!(agg.requests["a"].ok, 10);
    }
}
