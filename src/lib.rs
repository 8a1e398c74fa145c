#![deny(missing_docs)]

//! The server-side data plane of a sharded, replicated in-memory
//! key-value store.
//!
//! Every node runs identical workers that serve client requests over a
//! datagram transport, answer hot reads from a cache replicated across
//! all nodes, forward misses to the owning shard, and keep the
//! replicas convergent through a credited broadcast protocol.

pub mod bootstrap;
mod cache;
mod client;
pub mod config;
mod coherence;
mod error;
mod forward;
mod key;
pub mod protocol;
mod router;
mod server;
mod store;
pub mod transport;
mod worker;

pub use cache::CacheIndex;
pub use client::KvClient;
pub use coherence::{CoherenceContext, CoherenceStats, CreditState};
pub use config::ClusterConfig;
pub use error::{Result, ShardError};
pub use key::KeyFingerprint;
pub use router::{Partitioned, ShardRouter};
pub use server::{LocalClient, Node};
pub use store::KvStore;
pub use worker::{LocalRequest, WorkerStats};
