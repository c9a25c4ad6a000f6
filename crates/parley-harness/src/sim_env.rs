//! Simulated environment for deterministic testing.
//!
//! `SimEnv` is the simulation implementation of the Environment trait:
//!
//! - Time comes from tokio's clock. Under `#[tokio::test(start_paused =
//!   true)]` the clock only advances when every task is idle, so handshake
//!   backoff completes instantly and in a fixed order.
//! - Randomness comes from a seeded ChaCha20 stream. Same seed, same keys,
//!   same nonces.
//!
//! Clones share the RNG stream, so two clients built from clones of one
//! `SimEnv` draw distinct bytes.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use parley_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Wall clock reading at simulation start (2023-11-14T22:13:20Z)
pub const SIM_EPOCH_MILLIS: u64 = 1_700_000_000_000;

/// Deterministic environment: seeded RNG, tokio virtual time.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
    start: tokio::time::Instant,
}

impl SimEnv {
    /// Environment with seed 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with an explicit seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            start: tokio::time::Instant::now(),
        }
    }

    /// Virtual time elapsed since this environment was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn wall_clock_millis(&self) -> u64 {
        let elapsed = u64::try_from(self.elapsed().as_millis()).unwrap_or(u64::MAX);
        SIM_EPOCH_MILLIS.saturating_add(elapsed)
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }
}
