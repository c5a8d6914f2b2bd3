//! Peer-to-peer privacy mixer agent for a fixed-denomination shielded pool.
//!
//! One process plays four roles at once:
//! - a shielded-pool client that deposits and withdraws through Groth16
//!   proofs,
//! - a replica of the pool's per-chunk commitment trees,
//! - a Kademlia DHT participant for agent rendezvous,
//! - a relayer that accepts other agents' withdraws, delays them for
//!   unlinkability, and submits them under its own account.
//!
//! The chain adapter ([`chain::ChainClient`]) and the prover
//! ([`prover::Prover`]) are the two external capability boundaries; both
//! ship with in-memory doubles so the whole pipeline runs in tests.

pub mod agent;
pub mod beacon;
pub mod book;
pub mod chain;
pub mod codec;
pub mod config;
pub mod constants;
pub mod dht;
pub mod error;
pub mod handlers;
pub mod merkle;
pub mod metrics;
pub mod peers;
pub mod poseidon;
pub mod prover;
pub mod rate_limit;
pub mod relay_queue;
pub mod router;
pub mod state;
pub mod tree_fetch;
pub mod utils;
pub mod wallet;
