//! Closed workload model: a target number of concurrent users is kept in flight and
//! a replacement is started whenever a user finishes.
use std::{fmt, sync::Arc, time::Duration};

use tokio::sync::watch::Receiver;
use tokio::{task::JoinHandle, time::Instant};
use typed_builder::TypedBuilder;

use super::{Injector, Launch, Launcher, cancelled};
use crate::{error::ConfigurationError, protocol::Transport};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClosedPhase {
    ConstantConcurrentUsers { users: u64, during: Duration },
    /// Linearly moves the concurrency target from `from` to `to`.
    RampConcurrentUsers { from: u64, to: u64, during: Duration },
}

impl ClosedPhase {
    pub fn duration(&self) -> Duration {
        match *self {
            ClosedPhase::ConstantConcurrentUsers { during, .. } => during,
            ClosedPhase::RampConcurrentUsers { during, .. } => during,
        }
    }

    /// Users that should be in flight `elapsed` into the phase.
    pub fn target(&self, elapsed: Duration) -> u64 {
        match *self {
            ClosedPhase::ConstantConcurrentUsers { users, .. } => users,
            ClosedPhase::RampConcurrentUsers { from, to, during } => {
                let t = (elapsed.as_secs_f64() / during.as_secs_f64()).min(1.0);
                let target = from as f64 + (to as f64 - from as f64) * t;
                target.round().max(0.0) as u64
            }
        }
    }
}

impl fmt::Display for ClosedPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosedPhase::ConstantConcurrentUsers { users, during } => {
                write!(f, "constantConcurrentUsers({users}) during {during:?}")
            }
            ClosedPhase::RampConcurrentUsers { from, to, during } => {
                write!(f, "rampConcurrentUsers({from} to {to}) during {during:?}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClosedProfile {
    phases: Vec<ClosedPhase>,
}

impl ClosedProfile {
    pub fn new(phases: Vec<ClosedPhase>) -> Result<Self, ConfigurationError> {
        if phases.is_empty() {
            return Err(ConfigurationError::Injection(
                "closed profile has no phase".to_string(),
            ));
        }
        if let Some(phase) = phases.iter().find(|p| p.duration().is_zero()) {
            return Err(ConfigurationError::Injection(format!(
                "{phase}: duration must not be zero"
            )));
        }
        Ok(Self { phases })
    }

    pub fn phases(&self) -> &[ClosedPhase] {
        &self.phases
    }

    pub fn duration(&self) -> Duration {
        self.phases.iter().map(ClosedPhase::duration).sum()
    }
}

/// Injector for the closed workload model.
///
/// Every `tick` it drops the users that finished and starts new ones until the
/// in-flight count reaches the current target. When the target decreases, running
/// users are left to finish on their own.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ClosedInjector {
    pub profile: ClosedProfile,
    #[builder(default = Duration::from_millis(10))]
    pub tick: Duration,
}

impl Injector for ClosedInjector {
    async fn inject<T: Transport>(
        &self,
        launcher: Arc<Launcher<T>>,
        mut shutdown: Receiver<bool>,
    ) -> u64 {
        let name = launcher.scenario().name().to_string();
        tracing::info!(
            "Keeping users of `{name}` in flight for {:?}",
            self.profile.duration()
        );

        let mut launched = 0;
        tokio::select! {
            _ = self.keep_in_flight(&launcher, &mut launched) => {
                tracing::info!("Injection of `{name}` finished after {launched} users.");
            }
            _ = cancelled(&mut shutdown) => {
                tracing::info!("Injection of `{name}` cancelled after {launched} users.");
            }
        }
        launched
    }
}

impl ClosedInjector {
    async fn keep_in_flight<T: Transport>(&self, launcher: &Launcher<T>, launched: &mut u64) {
        let mut in_flight: Vec<JoinHandle<()>> = Vec::new();
        let j = self.profile.phases().len();
        for (i, phase) in self.profile.phases().iter().enumerate() {
            tracing::info!("Starting phase {i}/{j}: {phase}");
            let phase_start = Instant::now();
            let mut next_tick = phase_start;

            while next_tick.duration_since(phase_start) < phase.duration() {
                in_flight.retain(|user| !user.is_finished());
                let target = phase.target(next_tick.duration_since(phase_start));
                while (in_flight.len() as u64) < target {
                    *launched += 1;
                    match launcher.launch() {
                        Launch::Started(user) => in_flight.push(user),
                        // An exhausted feeder would otherwise be hit on every tick.
                        Launch::Rejected | Launch::Stopped => return,
                    }
                }
                tracing::debug!("{} users in flight, target {target}", in_flight.len());
                next_tick += self.tick;
                tokio::time::sleep_until(next_tick).await;
            }
            tracing::info!("Finishing phase {i}/{j}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_profiles() {
        assert!(ClosedProfile::new(vec![]).is_err());
        assert!(
            ClosedProfile::new(vec![ClosedPhase::ConstantConcurrentUsers {
                users: 3,
                during: Duration::ZERO
            }])
            .is_err()
        );
    }

    #[test]
    fn ramp_target_interpolates() {
        let phase = ClosedPhase::RampConcurrentUsers {
            from: 10,
            to: 20,
            during: Duration::from_secs(10),
        };
        assert_eq!(phase.target(Duration::ZERO), 10);
        assert_eq!(phase.target(Duration::from_secs(5)), 15);
        assert_eq!(phase.target(Duration::from_secs(10)), 20);
        assert_eq!(phase.target(Duration::from_secs(30)), 20);

        let down = ClosedPhase::RampConcurrentUsers {
            from: 20,
            to: 0,
            during: Duration::from_secs(4),
        };
        assert_eq!(down.target(Duration::from_secs(1)), 15);
        assert_eq!(down.target(Duration::from_secs(4)), 0);
    }

    #[test]
    fn constant_target_holds() {
        let phase = ClosedPhase::ConstantConcurrentUsers {
            users: 7,
            during: Duration::from_secs(1),
        };
        assert_eq!(phase.target(Duration::from_millis(500)), 7);
    }
}
