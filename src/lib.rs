//! Client-side routing for a replicated key-value cluster.
//!
//! The cluster has one master at a time. A [`Client`] discovers it lazily,
//! keeps one connection per node, retries calls across master changes within
//! a time budget, and can optionally send reads to a fixed non-master node.
//!
//! Modules:
//! - `client`: the facade plus master discovery, retry and dispatch
//! - `config`: cluster membership and tuning, from code or TOML
//! - `transport`: the connection seam, with a TCP implementation
//! - `wire`: the binary request/response codec
//! - `sim`: an in-process cluster for tests and demos
//! - `clock`: injectable time

pub mod client;
pub mod clock;
pub mod config;
pub mod error;
pub mod sim;
pub mod transport;
pub mod wire;

pub use client::{
    Client, ClientBuilder, RetryPolicy, MAX_BATCH_KEYS, MAX_KEY_SIZE, MAX_VALUE_SIZE,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClusterConfig, ClusterConfigBuilder, NodeId, NodeLocation};
pub use error::{ClientError, Result};
pub use wire::{ErrorCode, KeyRange, Sequence, Statistics, Version};
