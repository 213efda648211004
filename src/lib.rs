//! Tollgate - Token Bucket Rate Limiting Storage
//!
//! This crate implements token bucket rate limiting behind a single storage
//! trait. Buckets can live in process memory, with a background sweeper that
//! evicts idle keys, or in Redis, where each decision runs as one atomic Lua
//! script so several processes can share the same limits.

pub mod admission;
pub mod config;
pub mod error;
pub mod ratelimit;
