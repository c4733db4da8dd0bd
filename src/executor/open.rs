//! The `OpenInjector` and its components: an open workload model driven by a list of
//! injection [`Phase`]s.
//!
//! Users *arrive*: they are started on their own schedule and never wait on the users
//! already running. Phases run strictly in order, each one covering a contiguous
//! window that starts where the previous one ended.
//!
//! # High-level flow
//! 1. The injection profile is validated once, when it is built.
//! 2. The governor loop ticks every `tick`. On each tick it works out how many users
//!    are due by the end of the tick and launches them through the [`Launcher`].
//! 3. When the last phase is over (or shutdown is signalled) the injector returns.
//!    Users still running carry on; the simulation waits for their outcomes.
//!
//! # Mathematical behavior of the governor
//! Each phase has a cumulative arrival function `N(t)`: the number of users that
//! should have been started `t` into the phase.
//!
//! ```text
//! AtOnceUsers(n)               N(t) = n
//! RampUsers(n, d)              N(t) = n * t / d
//! ConstantUsersPerSec(r, d)    N(t) = r * t
//! RampUsersPerSec(a, b, d)     N(t) = a * t + (b - a) * t² / (2 * d)
//! NothingFor(d)                N(t) = 0
//! ```
//!
//! with `t` capped at the phase duration. On every tick the governor launches
//!
//! ```text
//! due = floor(N(t_end_of_tick)) - started
//! ```
//!
//! users. Fractional arrivals are never lost: they are carried in `N` itself, so the
//! long-term average matches the target rate exactly and a phase starts exactly
//! `floor(N(d))` users.
use std::{fmt, sync::Arc, time::Duration};

use tokio::sync::watch::Receiver;
use tokio::time::Instant;
use typed_builder::TypedBuilder;

use super::{Injector, Launch, Launcher, cancelled};
use crate::{error::ConfigurationError, protocol::Transport};
use internals::*;

/// One window of an open injection profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    /// Starts `n` users at once.
    AtOnceUsers(u64),
    /// Starts `users` users evenly spread over `over`.
    RampUsers { users: u64, over: Duration },
    /// Starts `rate` users per second during `during`.
    ConstantUsersPerSec { rate: f64, during: Duration },
    /// Ramps the arrival rate linearly from `from` to `to` users per second.
    RampUsersPerSec { from: f64, to: f64, during: Duration },
    /// Starts nobody for `d`.
    NothingFor(Duration),
}

impl Phase {
    pub fn duration(&self) -> Duration {
        match *self {
            Phase::AtOnceUsers(_) => Duration::ZERO,
            Phase::RampUsers { over, .. } => over,
            Phase::ConstantUsersPerSec { during, .. } => during,
            Phase::RampUsersPerSec { during, .. } => during,
            Phase::NothingFor(d) => d,
        }
    }

    /// Number of users this phase starts.
    pub fn users(&self) -> u64 {
        floor_users(cumulative_arrivals(self, self.duration()))
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let rates = match *self {
            Phase::ConstantUsersPerSec { rate, .. } => vec![rate],
            Phase::RampUsersPerSec { from, to, .. } => vec![from, to],
            _ => Vec::new(),
        };
        if let Some(rate) = rates.iter().find(|r| !r.is_finite() || **r < 0.0) {
            return Err(ConfigurationError::Injection(format!(
                "{self}: rate {rate} must be finite and non-negative"
            )));
        }
        let needs_duration = matches!(
            self,
            Phase::RampUsers { .. }
                | Phase::ConstantUsersPerSec { .. }
                | Phase::RampUsersPerSec { .. }
        );
        if needs_duration && self.duration().is_zero() {
            return Err(ConfigurationError::Injection(format!(
                "{self}: duration must not be zero"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::AtOnceUsers(n) => write!(f, "atOnceUsers({n})"),
            Phase::RampUsers { users, over } => write!(f, "rampUsers({users}) during {over:?}"),
            Phase::ConstantUsersPerSec { rate, during } => {
                write!(f, "constantUsersPerSec({rate}) during {during:?}")
            }
            Phase::RampUsersPerSec { from, to, during } => {
                write!(f, "rampUsersPerSec({from} to {to}) during {during:?}")
            }
            Phase::NothingFor(d) => write!(f, "nothingFor({d:?})"),
        }
    }
}

/// A validated, non-empty sequence of open-model phases.
#[derive(Debug, Clone, PartialEq)]
pub struct InjectionProfile {
    phases: Vec<Phase>,
}

impl InjectionProfile {
    pub fn new(phases: Vec<Phase>) -> Result<Self, ConfigurationError> {
        if phases.is_empty() {
            return Err(ConfigurationError::Injection(
                "profile has no phase".to_string(),
            ));
        }
        for phase in &phases {
            phase.validate()?;
        }
        Ok(Self { phases })
    }

    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Total users the profile starts.
    pub fn users(&self) -> u64 {
        self.phases.iter().map(Phase::users).sum()
    }

    /// Time from the first phase start to the last phase end.
    pub fn duration(&self) -> Duration {
        self.phases.iter().map(Phase::duration).sum()
    }
}

/// Injector for the open workload model.
///
/// - `tick`: granularity of governor updates. Smaller ticks start users closer to
///   their ideal arrival time but cause more wakeups. Default: 10ms.
#[derive(Debug, Clone, TypedBuilder)]
pub struct OpenInjector {
    pub profile: InjectionProfile,
    #[builder(default = Duration::from_millis(10))]
    pub tick: Duration,
}

impl Injector for OpenInjector {
    async fn inject<T: Transport>(
        &self,
        launcher: Arc<Launcher<T>>,
        mut shutdown: Receiver<bool>,
    ) -> u64 {
        let name = launcher.scenario().name().to_string();
        tracing::info!(
            "Injecting up to {} users into `{name}` over {:?}",
            self.profile.users(),
            self.profile.duration()
        );

        let mut launched = 0;
        tokio::select! {
            _ = governor(&self.profile, self.tick, &launcher, &mut launched) => {
                tracing::info!("Injection of `{name}` finished after {launched} users.");
            }
            _ = cancelled(&mut shutdown) => {
                tracing::info!("Injection of `{name}` cancelled after {launched} users.");
            }
        }
        launched
    }
}

#[cfg(feature = "internals")]
pub use internals::*;

/// Internal components for the `OpenInjector`.
/// Encapsulated in a module to allow conditional exposure via `#[cfg(feature = "internals")]`.
mod internals {
    use super::*;

    /// Users beyond this are never started by a single phase.
    pub const MAX_USERS: u64 = u64::MAX >> 3;

    /// Walks every phase and launches users as they become due.
    pub async fn governor<T: Transport>(
        profile: &InjectionProfile,
        tick: Duration,
        launcher: &Launcher<T>,
        launched: &mut u64,
    ) {
        let j = profile.phases().len();
        for (i, phase) in profile.phases().iter().enumerate() {
            tracing::info!("Starting phase {i}/{j}: {phase}");
            let phase_start = Instant::now();
            let duration = phase.duration();
            let mut started = 0;
            let mut next_tick = phase_start;

            loop {
                next_tick += tick;
                let elapsed = next_tick.duration_since(phase_start).min(duration);
                let due = calc_arrivals(phase, elapsed, started);
                for _ in 0..due {
                    started += 1;
                    *launched += 1;
                    match launcher.launch() {
                        Launch::Started(_) | Launch::Rejected => {}
                        Launch::Stopped => return,
                    }
                }
                if elapsed >= duration {
                    break;
                }
                tokio::time::sleep_until(next_tick).await;
            }
            // The next phase starts exactly where this one ends.
            tokio::time::sleep_until(phase_start + duration).await;
            tracing::info!("Finishing phase {i}/{j}: {started} users started");
        }
    }

    /// Users of `phase` that should have arrived `elapsed` into it (fractional).
    pub fn cumulative_arrivals(phase: &Phase, elapsed: Duration) -> f64 {
        let t = elapsed.min(phase.duration()).as_secs_f64();
        match *phase {
            Phase::AtOnceUsers(n) => n as f64,
            Phase::RampUsers { users, over } => users as f64 * t / over.as_secs_f64(),
            Phase::ConstantUsersPerSec { rate, .. } => rate * t,
            Phase::RampUsersPerSec { from, to, during } => {
                from * t + (to - from) * t * t / (2.0 * during.as_secs_f64())
            }
            Phase::NothingFor(_) => 0.0,
        }
    }

    /// Pure function computing how many users to launch on a tick ending `elapsed`
    /// into `phase`, given that `started` were launched already.
    pub fn calc_arrivals(phase: &Phase, elapsed: Duration, started: u64) -> u64 {
        floor_users(cumulative_arrivals(phase, elapsed)).saturating_sub(started)
    }

    /// Safely converts a fractional user count, saturating at [`MAX_USERS`].
    pub fn floor_users(users: f64) -> u64 {
        // `users` stays finite for valid profiles; NaN converts to 0.
        let floored = (users + 1e-9).floor();
        if floored >= MAX_USERS as f64 {
            MAX_USERS
        } else if floored < 0.0 {
            0
        } else {
            floored as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn rejects_invalid_profiles() {
        assert!(InjectionProfile::new(vec![]).is_err());
        assert!(
            InjectionProfile::new(vec![Phase::ConstantUsersPerSec {
                rate: -1.0,
                during: secs(1)
            }])
            .is_err()
        );
        assert!(
            InjectionProfile::new(vec![Phase::ConstantUsersPerSec {
                rate: f64::NAN,
                during: secs(1)
            }])
            .is_err()
        );
        assert!(
            InjectionProfile::new(vec![Phase::RampUsersPerSec {
                from: 1.0,
                to: 5.0,
                during: Duration::ZERO
            }])
            .is_err()
        );
        assert!(
            InjectionProfile::new(vec![Phase::AtOnceUsers(1), Phase::NothingFor(Duration::ZERO)])
                .is_ok()
        );
    }

    #[test]
    fn users_sum_over_phases() {
        let profile = InjectionProfile::new(vec![
            Phase::AtOnceUsers(10),
            Phase::NothingFor(secs(5)),
            Phase::RampUsers {
                users: 10,
                over: secs(5),
            },
            Phase::ConstantUsersPerSec {
                rate: 20.0,
                during: secs(15),
            },
            Phase::RampUsersPerSec {
                from: 10.0,
                to: 20.0,
                during: secs(10),
            },
        ])
        .unwrap();

        assert_eq!(profile.users(), 10 + 10 + 300 + 150);
        assert_eq!(profile.duration(), secs(35));
    }

    mod calc_arrivals {
        use super::*;

        #[test]
        fn linearity() {
            let mut rate = 1.;
            let mut expected = 10;
            for _ in 0..8 {
                let phase = Phase::ConstantUsersPerSec {
                    rate,
                    during: secs(100),
                };
                assert_eq!(calc_arrivals(&phase, secs(10), 0), expected);

                rate *= 10.;
                expected *= 10;
            }
        }

        #[test]
        fn fractional_accumulation() {
            let phase = Phase::ConstantUsersPerSec {
                rate: 12.5,
                during: secs(10),
            };
            let tick = Duration::from_millis(100);
            let mut started = 0;
            let mut per_tick = Vec::new();
            for i in 1..=8 {
                let due = calc_arrivals(&phase, tick * i, started);
                started += due;
                per_tick.push(due);
            }
            // 1.25 users per tick: the carry turns every fourth tick into 2
            assert_eq!(per_tick, vec![1, 1, 1, 2, 1, 1, 1, 2]);
            assert_eq!(started, 10);
        }

        #[test]
        fn ramp_up() {
            let phase = Phase::RampUsersPerSec {
                from: 0.,
                to: 100.,
                during: secs(10),
            };
            // N(t) = 5 t²
            for i in 0..=10 {
                assert_eq!(calc_arrivals(&phase, secs(i), 0), 5 * i * i);
            }
        }

        #[test]
        fn ramp_down() {
            let phase = Phase::RampUsersPerSec {
                from: 100.,
                to: 0.,
                during: secs(10),
            };
            let mut previous = 0;
            for i in 1..=10 {
                let total = calc_arrivals(&phase, secs(i), 0);
                let this_second = total - previous;
                // the rate at the middle of second i
                assert_eq!(this_second, 100 - 10 * i + 5);
                previous = total;
            }
            assert_eq!(previous, 500);
        }

        #[test]
        fn hold_steady() {
            let phase = Phase::ConstantUsersPerSec {
                rate: 100.,
                during: secs(10),
            };
            let mut started = 0;
            for i in 1..=10 {
                let due = calc_arrivals(&phase, secs(i), started);
                assert_eq!(due, 100);
                started += due;
            }
        }

        #[test]
        fn ramp_users_spread_evenly() {
            let phase = Phase::RampUsers {
                users: 10,
                over: secs(10),
            };
            for i in 0..=10 {
                assert_eq!(calc_arrivals(&phase, secs(i), 0), i);
            }
        }

        #[test]
        fn elapsed_over_duration_caps_at_phase_total() {
            let phase = Phase::ConstantUsersPerSec {
                rate: 100.,
                during: secs(10),
            };
            for i in 10..20 {
                assert_eq!(calc_arrivals(&phase, secs(i), 0), 1000);
            }
        }

        #[test]
        fn already_started_users_are_not_relaunched() {
            let phase = Phase::AtOnceUsers(5);
            assert_eq!(calc_arrivals(&phase, Duration::ZERO, 0), 5);
            assert_eq!(calc_arrivals(&phase, secs(1), 5), 0);
            assert_eq!(calc_arrivals(&phase, secs(1), 7), 0);
        }

        #[test]
        fn negative_value_returns_0() {
            assert_eq!(floor_users(-100.), 0);
        }

        #[test]
        fn extreme_rate_caps_at_max_users() {
            let phase = Phase::ConstantUsersPerSec {
                rate: f64::MAX,
                during: secs(1),
            };
            assert_eq!(calc_arrivals(&phase, secs(1), 0), MAX_USERS);
        }
    }
}
