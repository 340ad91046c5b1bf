//! NNTP protocol sessions and the concurrent posting engine
//!
//! `connection` drives one authenticated session; `engine` owns a pool of
//! them plus the work queue and retry policy.

mod connection;
mod engine;
#[cfg(test)]
pub(crate) mod testing;

pub use connection::{ConnectError, NntpConnection, PostOutcome, StatOutcome};
pub use engine::{
    generate_nonce, EngineOptions, NonceGenerator, PostingEngine, PostingEngineBuilder,
};
