//! TalkTime rate limiting service
//!
//! This crate implements the sliding-log rate limiter that guards the
//! TalkTime conversation practice API. A process-local limiter covers a
//! single instance; a store-backed limiter shares request logs through
//! Redis or a peer-to-peer gossip mesh, with an explicit policy for store
//! outages.

pub mod config;
pub mod error;
pub mod http;
pub mod mesh;
pub mod ratelimit;
pub mod telemetry;
