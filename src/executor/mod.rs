//! Executor: orchestration of virtual users over time.
//!
//! An [`Injector`] decides *when* virtual users start; a [`user::Launcher`] decides
//! *how* each one starts (id, session, feeder record, seeded rng) and spawns the
//! [`user::VirtualUser`] that walks the scenario.
//!
//! Two injectors are provided:
//! - [`OpenInjector`]: open workload model. Users arrive according to an
//!   [`InjectionProfile`] regardless of how many are still running.
//! - [`ClosedInjector`]: closed workload model. The number of users in flight is
//!   kept at the target given by a [`ClosedProfile`].
pub mod closed;
pub mod open;
pub mod user;

pub use closed::{ClosedInjector, ClosedPhase, ClosedProfile};
pub use open::{InjectionProfile, OpenInjector, Phase};
pub use user::{ExhaustionPolicy, FailureMode, Launch, Launcher, VirtualUser};

use std::{future::Future, sync::Arc};

use tokio::sync::watch::Receiver;

use crate::protocol::Transport;

/// The runtime hook that schedules the virtual users of one population.
///
/// Implementations start users through the [`Launcher`] until their profile is over,
/// the launcher reports that it cannot start any more users, or `shutdown` flips to
/// `true`. They never wait on running users. Returns the number of launch attempts.
pub trait Injector
where
    Self: Send + Sync,
{
    fn inject<T: Transport>(
        &self,
        launcher: Arc<Launcher<T>>,
        shutdown: Receiver<bool>,
    ) -> impl Future<Output = u64> + Send;
}

/// Resolves once `shutdown` is `true`. Never resolves if the sender is gone first.
pub(crate) async fn cancelled(shutdown: &mut Receiver<bool>) {
    if shutdown.wait_for(|b| *b).await.is_err() {
        std::future::pending::<()>().await;
    }
}
