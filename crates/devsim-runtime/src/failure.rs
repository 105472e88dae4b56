//! Simulated outages

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use devsim_core::{DeviceIdentity, FailureProfile};

use crate::state::RunState;

/// Randomly forces the device into a full outage.
pub struct FailureInjector {
    identity: DeviceIdentity,
    profile: FailureProfile,
    rng: Mutex<StdRng>,
    outages: AtomicU64,
}

impl FailureInjector {
    pub fn new(identity: DeviceIdentity, profile: FailureProfile) -> Self {
        Self::with_rng(identity, profile, StdRng::from_entropy())
    }

    pub fn with_seed(identity: DeviceIdentity, profile: FailureProfile, seed: u64) -> Self {
        Self::with_rng(identity, profile, StdRng::seed_from_u64(seed))
    }

    fn with_rng(identity: DeviceIdentity, profile: FailureProfile, rng: StdRng) -> Self {
        FailureInjector {
            identity,
            profile,
            rng: Mutex::new(rng),
            outages: AtomicU64::new(0),
        }
    }

    pub fn profile(&self) -> &FailureProfile {
        &self.profile
    }

    /// Roll for an outage. On a hit, pause `run_state`, hold the calling
    /// task for the outage duration, then resume.
    ///
    /// Returns whether an outage took place.
    pub async fn check_and_maybe_fail(&self, run_state: &RunState) -> bool {
        let hit = self.rng.lock().gen::<f64>() < self.profile.failure_probability();
        if !hit {
            return false;
        }

        let outage = self.profile.outage_duration();
        self.outages.fetch_add(1, Ordering::Relaxed);
        run_state.pause();
        tracing::warn!(
            pod = %self.identity,
            outage = %humantime::format_duration(outage),
            "Simulated failure, link going down"
        );

        tokio::time::sleep(outage).await;

        run_state.resume();
        tracing::info!(pod = %self.identity, "Recovered from simulated failure");
        true
    }

    /// Outages started so far
    pub fn outages(&self) -> u64 {
        self.outages.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("dev-1").unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_fails() {
        let injector = FailureInjector::with_seed(identity(), FailureProfile::never(), 3);
        let state = RunState::new();

        for _ in 0..100 {
            assert!(!injector.check_and_maybe_fail(&state).await);
        }
        assert_eq!(injector.outages(), 0);
        assert!(!state.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_pauses_for_duration() {
        let profile = FailureProfile::new(1.0, Duration::from_secs(40)).unwrap();
        let injector = Arc::new(FailureInjector::with_seed(identity(), profile, 3));
        let state = Arc::new(RunState::new());

        let task = {
            let injector = injector.clone();
            let state = state.clone();
            tokio::spawn(async move { injector.check_and_maybe_fail(&state).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(state.is_paused());

        tokio::time::sleep(Duration::from_secs(38)).await;
        assert!(state.is_paused());

        assert!(task.await.unwrap());
        assert!(!state.is_paused());
        assert_eq!(injector.outages(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_rate_converges() {
        let profile = FailureProfile::new(0.2, Duration::ZERO).unwrap();
        let injector = FailureInjector::with_seed(identity(), profile, 11);
        let state = RunState::new();

        let n = 2000;
        for _ in 0..n {
            injector.check_and_maybe_fail(&state).await;
        }
        let rate = injector.outages() as f64 / n as f64;
        assert!((rate - 0.2).abs() < 0.03, "failure rate {}", rate);
    }
}
