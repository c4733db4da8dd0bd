use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::fmt::Debug;
use std::future::Future;
use std::time::Duration;

use crate::{
    Aggregate,
    aggregate::{RequestStats, RunAggregate},
    assertion::{AssertionResult, Verdict},
    metric::OutcomeStatus,
};

/// A [`Report`] represents the processed form of an [`Aggregate`].
///
/// Reports transform raw aggregated data into meaningful insights, such as
/// averages, percentiles, ratios and totals. They are *pure data structures*, free
/// of side effects and I/O.
///
/// Implementors define how to construct the report from an [`Aggregate`] through a
/// [`From<A>`] implementation. Once created, a report can be serialized, logged,
/// or consumed by a [`Reporter`].
///
/// # Example
/// ```rust
/// use horda::{Aggregate, Report, aggregate::RunAggregate};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct UsersOnly {
///     users: u64,
/// }
///
/// impl From<RunAggregate> for UsersOnly {
///     fn from(a: RunAggregate) -> Self {
///         Self { users: a.total_users() }
///     }
/// }
///
/// impl Report<RunAggregate> for UsersOnly {}
///
/// assert_eq!(UsersOnly::from(RunAggregate::new()).users, 0);
/// ```
///
/// See also: [`Reporter`].
pub trait Report<A>
where
    Self: Send + Sync + Debug + From<A> + Serialize + DeserializeOwned,
    A: Aggregate,
{
}

/// A [`Reporter`] consumes a [`Report`] and performs side effects: displaying it,
/// sending it to a service, or persisting it somewhere.
///
/// Reporters are the I/O boundary of the engine. Keeping them apart lets the
/// computation layer (outcomes → aggregate → report) stay pure and deterministic.
///
/// # Example
/// ```rust
/// use horda::{Aggregate, Report, Reporter};
/// struct MyReporter;
/// impl<A: Aggregate, R: Report<A>> Reporter<A, R> for MyReporter {
///     async fn report(&self, report: &R) -> Result<(), Box<dyn std::error::Error>> {
///         println!("{:?}", report);
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter<A: Aggregate, R: Report<A>> {
    fn report(&self, report: &R) -> impl Future<Output = Result<(), Box<dyn std::error::Error>>>;
}

/// Rates over windows shorter than this are computed over this instead.
const MIN_RATE_WINDOW: Duration = Duration::from_secs(1);

fn millis(micros: u64) -> f64 {
    micros as f64 / 1000.0
}

impl RequestStats {
    /// Percentage of failed requests; `0` when nothing was recorded.
    pub fn failed_percent(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.ko as f64 * 100.0 / n as f64,
        }
    }

    /// Percentage of successful requests; `0` when nothing was recorded.
    pub fn successful_percent(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.ok as f64 * 100.0 / n as f64,
        }
    }

    pub fn min_ms(&self) -> Option<f64> {
        self.latencies().map(|h| millis(h.min()))
    }

    pub fn mean_ms(&self) -> Option<f64> {
        self.latencies().map(|h| h.mean() / 1000.0)
    }

    pub fn max_ms(&self) -> Option<f64> {
        self.latencies().map(|h| millis(h.max()))
    }

    /// Latency at percentile `p` (0 to 100).
    pub fn percentile_ms(&self, p: f64) -> Option<f64> {
        self.latencies().map(|h| millis(h.value_at_percentile(p)))
    }

    pub fn requests_per_sec(&self, window: Duration) -> f64 {
        self.count() as f64 / window.max(MIN_RATE_WINDOW).as_secs_f64()
    }
}

/// Summary of one request name, or of every request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSummary {
    pub name: String,
    pub count: u64,
    pub ok: u64,
    pub ko: u64,
    pub failed_percent: f64,
    pub min_ms: Option<f64>,
    pub mean_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p75_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub requests_per_sec: f64,
}

impl RequestSummary {
    fn new(name: impl Into<String>, stats: &RequestStats, window: Duration) -> Self {
        Self {
            name: name.into(),
            count: stats.count(),
            ok: stats.ok,
            ko: stats.ko,
            failed_percent: stats.failed_percent(),
            min_ms: stats.min_ms(),
            mean_ms: stats.mean_ms(),
            p50_ms: stats.percentile_ms(50.0),
            p75_ms: stats.percentile_ms(75.0),
            p95_ms: stats.percentile_ms(95.0),
            p99_ms: stats.percentile_ms(99.0),
            max_ms: stats.max_ms(),
            requests_per_sec: stats.requests_per_sec(window),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorCount {
    pub error: String,
    pub count: u64,
    /// Share of all recorded errors.
    pub percent: f64,
}

/// The structured result of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub simulation: String,
    /// From the first user start to the last user end.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub users: UserSummary,
    pub global: RequestSummary,
    pub requests: Vec<RequestSummary>,
    /// Most frequent first.
    pub errors: Vec<ErrorCount>,
    pub assertions: Vec<AssertionResult>,
    pub verdict: Verdict,
}

impl From<RunAggregate> for RunReport {
    fn from(agg: RunAggregate) -> Self {
        let window = agg.window();
        let users = UserSummary {
            total: agg.total_users(),
            completed: agg.users_with(OutcomeStatus::Completed),
            failed: agg.users_with(OutcomeStatus::Failed),
            timed_out: agg.users_with(OutcomeStatus::TimedOut),
            cancelled: agg.users_with(OutcomeStatus::Cancelled),
        };

        let total_errors: u64 = agg.errors.values().sum();
        let mut errors: Vec<ErrorCount> = agg
            .errors
            .into_iter()
            .map(|(error, count)| ErrorCount {
                error,
                count,
                percent: count as f64 * 100.0 / total_errors as f64,
            })
            .collect();
        errors.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.error.cmp(&b.error)));

        Self {
            simulation: String::new(),
            duration: window,
            users,
            global: RequestSummary::new("Global", &agg.global, window),
            requests: agg
                .requests
                .iter()
                .map(|(name, stats)| RequestSummary::new(name.as_str(), stats, window))
                .collect(),
            errors,
            assertions: Vec::new(),
            verdict: Verdict::NotEvaluated,
        }
    }
}

impl Report<RunAggregate> for RunReport {}

impl RunReport {
    pub fn named(mut self, simulation: impl Into<String>) -> Self {
        self.simulation = simulation.into();
        self
    }

    /// Attaches assertion results and derives the verdict from them.
    pub fn with_assertions(mut self, results: Vec<AssertionResult>) -> Self {
        self.verdict = Verdict::of(&results);
        self.assertions = results;
        self
    }
}

#[cfg(feature = "builtins")]
pub use builtins::*;

#[cfg(feature = "builtins")]
mod builtins {
    use std::{fmt::Write as _, path::PathBuf};

    use super::*;

    fn cell(value: Option<f64>) -> String {
        value.map_or_else(|| "-".to_string(), |v| format!("{v:.0}"))
    }

    fn row(out: &mut String, s: &RequestSummary) -> std::fmt::Result {
        writeln!(
            out,
            "{:<32} {:>8} {:>8} {:>8} {:>6.1}% {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>8.2}",
            s.name,
            s.count,
            s.ok,
            s.ko,
            s.failed_percent,
            cell(s.min_ms),
            cell(s.mean_ms),
            cell(s.p50_ms),
            cell(s.p75_ms),
            cell(s.p95_ms),
            cell(s.p99_ms),
            cell(s.max_ms),
            s.requests_per_sec,
        )
    }

    /// Renders a run report as a plain text summary.
    pub fn render(report: &RunReport) -> Result<String, std::fmt::Error> {
        let mut out = String::new();
        writeln!(out, "==== {} ({:?}) ====", report.simulation, report.duration)?;
        let u = &report.users;
        writeln!(
            out,
            "users: {} (completed={} failed={} timed out={} cancelled={})",
            u.total, u.completed, u.failed, u.timed_out, u.cancelled
        )?;
        writeln!(
            out,
            "{:<32} {:>8} {:>8} {:>8} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>7} {:>8}",
            "request", "count", "ok", "ko", "ko", "min", "mean", "p50", "p75", "p95", "p99",
            "max", "req/s"
        )?;
        row(&mut out, &report.global)?;
        for request in &report.requests {
            row(&mut out, request)?;
        }
        if !report.errors.is_empty() {
            writeln!(out, "---- errors ----")?;
            for e in &report.errors {
                writeln!(out, "{:>8} ({:>5.1}%) {}", e.count, e.percent, e.error)?;
            }
        }
        if !report.assertions.is_empty() {
            writeln!(out, "---- assertions ----")?;
            for a in &report.assertions {
                let observed = a.observed.map_or_else(|| "none".to_string(), |v| format!("{v:.2}"));
                let mark = if a.passed { "OK" } else { "KO" };
                writeln!(out, "[{mark}] {}: observed {observed}", a.description)?;
            }
        }
        writeln!(out, "verdict: {:?}", report.verdict)?;
        Ok(out)
    }

    /// Prints a text summary of the run to stdout.
    pub struct StdoutReporter;

    impl Reporter<RunAggregate, RunReport> for StdoutReporter {
        async fn report(&self, report: &RunReport) -> Result<(), Box<dyn std::error::Error>> {
            print!("{}", render(report)?);
            Ok(())
        }
    }

    /// Writes the report as pretty-printed JSON to `path`, or to stdout without one.
    #[derive(Debug, Clone, Default)]
    pub struct JsonReporter {
        pub path: Option<PathBuf>,
    }

    impl Reporter<RunAggregate, RunReport> for JsonReporter {
        async fn report(&self, report: &RunReport) -> Result<(), Box<dyn std::error::Error>> {
            let json = serde_json::to_string_pretty(report)?;
            match &self.path {
                Some(path) => {
                    tokio::fs::write(path, json).await?;
                    tracing::info!("Report written to {}", path.display());
                }
                None => println!("{json}"),
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::UserError,
        metric::{RunOutcome, StepRecord},
    };

    fn outcome(user_id: u64, latencies_ms: &[(u64, bool)]) -> RunOutcome {
        RunOutcome {
            user_id,
            scenario: "s".to_string(),
            start: Duration::ZERO,
            end: Duration::from_secs(10),
            steps: latencies_ms
                .iter()
                .map(|&(ms, ok)| StepRecord {
                    name: "page".to_string(),
                    group: None,
                    start: Duration::ZERO,
                    latency: Some(Duration::from_millis(ms)),
                    ok,
                    error: (!ok).then(|| UserError::Request("connection failed: refused".into())),
                })
                .collect(),
            events: Vec::new(),
            status: OutcomeStatus::Completed,
            failure: None,
        }
    }

    #[test]
    fn summarizes_requests() {
        let mut agg = RunAggregate::new();
        let latencies: Vec<(u64, bool)> = (1..=100).map(|ms| (ms, ms % 10 != 0)).collect();
        agg.consume(&outcome(0, &latencies));

        let report = RunReport::from(agg).named("sim");

        assert_eq!(report.simulation, "sim");
        assert_eq!(report.users.total, 1);
        assert_eq!(report.global.count, 100);
        assert_eq!(report.global.ko, 10);
        assert_eq!(report.global.failed_percent, 10.0);
        assert_eq!(report.global.requests_per_sec, 10.0);
        let p50 = report.global.p50_ms.unwrap();
        assert!((49.9..=50.1).contains(&p50));
        let max = report.global.max_ms.unwrap();
        assert!((99.9..=100.1).contains(&max));
        assert_eq!(report.requests.len(), 1);
        assert_eq!(report.errors[0].count, 10);
        assert_eq!(report.errors[0].percent, 100.0);
        assert_eq!(report.verdict, Verdict::NotEvaluated);
    }

    #[test]
    fn empty_runs_have_no_latencies() {
        let report = RunReport::from(RunAggregate::new());
        assert_eq!(report.global.count, 0);
        assert_eq!(report.global.failed_percent, 0.0);
        assert_eq!(report.global.mean_ms, None);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn serializes_to_json() {
        let report = RunReport::from(RunAggregate::new()).named("sim");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["simulation"], "sim");
        assert_eq!(json["verdict"], "NotEvaluated");
        let back: RunReport = serde_json::from_value(json).unwrap();
        assert_eq!(back, report);
    }

    #[cfg(feature = "builtins")]
    #[test]
    fn renders_text_summary() {
        let mut agg = RunAggregate::new();
        agg.consume(&outcome(0, &[(12, true), (30, false)]));
        let text = render(&RunReport::from(agg).named("sim")).unwrap();
        assert!(text.contains("==== sim"));
        assert!(text.contains("page"));
        assert!(text.contains("RequestError: connection failed: refused"));
    }
}
