//! Orion Screener Library
//!
//! Polls the Orion Terminal screener API on a bounded schedule, normalizes
//! the coin rows and publishes hash-chained snapshots to the Firebase
//! Realtime Database.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   blocked   ┌──────────────────┐
//! │   fetcher    │────────────▶│  orion-browser   │
//! │ (reqwest +   │◀────────────│ (cookie harvest) │
//! │  rotation)   │   cookies   └──────────────────┘
//! └──────┬───────┘
//!        │ raw JSON
//!        ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  normalizer  │──▶│   snapshot   │──▶│     sink     │──▶ Firebase RTDB
//! └──────────────┘   │ (hash chain) │   └──────────────┘
//!                    └──────┬───────┘
//!                           ▼
//!                    ┌──────────────┐   ┌──────────────┐
//!                    │   trading    │──▶│ notification │──▶ Telegram
//!                    │ (RSI, paper) │   └──────────────┘
//!                    └──────────────┘
//! ```
//!
//! The [`runner::Runner`] drives the cycle and guards it with a
//! [`circuit_breaker::CircuitBreaker`].

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod circuit_breaker;
pub mod fetcher;
pub mod normalizer;
pub mod notification;
pub mod runner;
pub mod sink;
pub mod snapshot;
pub mod trading;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use fetcher::{FetchError, ScreenerClient};
pub use normalizer::{CoinRecord, Normalizer};
pub use runner::{CycleError, RunStats, Runner};
pub use sink::{store_from_config, DocumentStore, MemoryStore, SinkError, SnapshotSink};
pub use snapshot::{Snapshot, SnapshotChain};
