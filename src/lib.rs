//! Tollgate - Distributed Token-Bucket Admission Control
//!
//! This crate implements per-caller rate limiting for HTTP services. Named
//! profiles define a token bucket (limit, window, refill strategy); each
//! caller gets its own bucket per profile, kept in a shared store and
//! updated with an atomic compare-and-swap so that every instance of the
//! service enforces the same limit.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod store;
