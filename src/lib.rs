//! Horda: a load-testing engine that drives scripted virtual users against a system
//! under test.
//!
//! A simulation describes *who* arrives (injection profiles), *what* each of them does
//! (a scenario of requests, pauses, loops, retries and checks) and *what counts as a
//! pass* (assertions over the aggregated results). Every virtual user owns its own
//! [`session::Session`], runs as its own tokio task and reports exactly one
//! [`RunOutcome`] when it is done.
//!
//! # Architecture
//!
//! The main building blocks are:
//!
//! - [`scenario::Scenario`]: immutable chain of steps shared by every user of a population.
//! - [`protocol::ProtocolExecutor`]: resolves templates, merges the global
//!   [`protocol::HttpProtocol`] configuration and performs exchanges through a
//!   [`protocol::Transport`].
//! - [`executor`]: the virtual user state machine and the open/closed injectors that
//!   decide when users start.
//! - [`Metric`]: the smallest unit produced by a run. Every finished user produces one
//!   [`RunOutcome`].
//! - [`Aggregate`]: folds metrics into a compact representation, here
//!   [`aggregate::RunAggregate`] with its latency histograms.
//! - [`Report`]: turns an aggregate into human- or machine-friendly output, and
//!   [`Reporter`] sends it somewhere (stdout, file).
//! - [`Simulation`]: glues everything together and evaluates the
//!   [`assertion::AssertionSpec`]s into a verdict.
//!
//! # Feature flags
//! - `builtins` (default): `reqwest` transport, stdout and JSON reporters, and the
//!   `horda` command line runner.
//! - `internals`: enable access to internal (and unstable) functions, such as the
//!   arrival calculations of the open injector.
//!
//! # Where to start
//!
//! Read the docs for [`Simulation`] and [`scenario::Chain`], or write a JSON definition
//! (see [`config`]) and run it with the `horda` binary.

/// Metric aggregators
pub mod aggregate;
/// Assertions over aggregated results
pub mod assertion;
/// Response checks
pub mod check;
/// JSON simulation definitions
pub mod config;
pub mod error;
/// Virtual users and the injectors that start them
pub mod executor;
pub mod feeder;
/// Single metrics
pub mod metric;
pub mod protocol;
/// Reports and Reporters
pub mod report;
pub mod scenario;
pub mod session;
/// Main module of the framework that glues everything together
pub mod simulation;
pub mod template;

pub use aggregate::Aggregate;
pub use assertion::{AssertionSpec, Verdict};
pub use error::{ConfigurationError, UserError};
pub use executor::{FailureMode, Injector};
pub use metric::{Metric, RunOutcome};
pub use report::{Report, Reporter, RunReport};
pub use scenario::{Chain, Scenario};
pub use simulation::{Population, Simulation};
