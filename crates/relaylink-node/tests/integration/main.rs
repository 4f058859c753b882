//! Integration test entry point for relaylink-node.
//!
//! Run with: cargo test -p relaylink-node --test integration

mod harness;
mod handshake;
mod task_execution;
mod bypass;
mod rendezvous;
