//! Deterministic simulation harness for the Parley session protocol.
//!
//! Runs real clients against a real in-process relay with a seeded RNG and
//! tokio's paused clock, so every handshake, backoff and replay scenario is
//! reproducible from its seed.
//!
//! # Components
//!
//! - [`SimEnv`]: seeded ChaCha20 randomness plus virtual time
//! - [`SimWorld`]: one relay, clients with their own device stores
//! - [`invariants`]: properties checked against world snapshots

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod sim_env;
pub mod world;

pub use invariants::{
    Invariant, InvariantRegistry, InvariantResult, NoReplayedNonce, SequenceMonotonicity,
    SessionAgreement, SessionView, Violation, WorldSnapshot,
};
pub use sim_env::{SIM_EPOCH_MILLIS, SimEnv};
pub use world::{SimClient, SimRelay, SimWorld, establish, rotate};
