//! Network condition simulation
//!
//! Every send attempt pays a uniformly drawn delay from the profile's
//! `[min_delay, max_delay]` and is then dropped with the profile's loss
//! probability.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use devsim_core::NetworkProfile;

pub struct NetworkConditionSimulator {
    profile: NetworkProfile,
    rng: Mutex<StdRng>,
    attempts: AtomicU64,
    dropped: AtomicU64,
}

impl NetworkConditionSimulator {
    pub fn new(profile: NetworkProfile) -> Self {
        Self::with_rng(profile, StdRng::from_entropy())
    }

    /// Deterministic simulator for reproducible runs
    pub fn with_seed(profile: NetworkProfile, seed: u64) -> Self {
        Self::with_rng(profile, StdRng::seed_from_u64(seed))
    }

    fn with_rng(profile: NetworkProfile, rng: StdRng) -> Self {
        NetworkConditionSimulator {
            profile,
            rng: Mutex::new(rng),
            attempts: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn profile(&self) -> &NetworkProfile {
        &self.profile
    }

    /// Simulate one send attempt.
    ///
    /// Always sleeps for the injected delay, lost or not.
    ///
    /// # Returns
    /// * `true` - Proceed with the send
    /// * `false` - The packet is lost
    pub async fn attempt_send(&self) -> bool {
        let delay = self.sample_delay();
        tokio::time::sleep(delay).await;

        self.attempts.fetch_add(1, Ordering::Relaxed);
        let lost = self.rng.lock().gen::<f64>() < self.profile.loss_probability();
        if lost {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Simulated packet loss after {:?}", delay);
        }
        !lost
    }

    fn sample_delay(&self) -> Duration {
        let (min, max) = (self.profile.min_delay(), self.profile.max_delay());
        if min >= max {
            return min;
        }
        self.rng.lock().gen_range(min..=max)
    }

    /// Attempts made so far
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Attempts reported as lost so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(min_ms: u64, max_ms: u64, loss: f64) -> NetworkProfile {
        NetworkProfile::new(
            Duration::from_millis(min_ms),
            Duration::from_millis(max_ms),
            loss,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_within_bounds() {
        let sim = NetworkConditionSimulator::with_seed(profile(10, 100, 0.0), 7);

        for _ in 0..50 {
            let start = tokio::time::Instant::now();
            assert!(sim.attempt_send().await);
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_millis(10), "{:?}", elapsed);
            assert!(elapsed <= Duration::from_millis(101), "{:?}", elapsed);
        }
        assert_eq!(sim.attempts(), 50);
        assert_eq!(sim.dropped(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_attempts_still_pay_delay() {
        let sim = NetworkConditionSimulator::with_seed(profile(50, 50, 1.0), 1);

        let start = tokio::time::Instant::now();
        assert!(!sim.attempt_send().await);
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(sim.dropped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loss_rate_converges() {
        let sim = NetworkConditionSimulator::with_seed(profile(0, 0, 0.3), 42);

        let n = 5000;
        let mut lost = 0;
        for _ in 0..n {
            if !sim.attempt_send().await {
                lost += 1;
            }
        }
        let rate = lost as f64 / n as f64;
        assert!((rate - 0.3).abs() < 0.03, "loss rate {}", rate);
        assert_eq!(sim.dropped(), lost);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seed_is_reproducible() {
        let a = NetworkConditionSimulator::with_seed(profile(0, 5, 0.5), 99);
        let b = NetworkConditionSimulator::with_seed(profile(0, 5, 0.5), 99);

        for _ in 0..100 {
            assert_eq!(a.attempt_send().await, b.attempt_send().await);
        }
    }
}
