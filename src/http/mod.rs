//! HTTP surface for the rate limit service.

mod server;
mod service;

pub use server::HttpServer;
pub use service::{
    client_identifier, decision_response, enforce_rate_limit, router, LIMIT_HEADER,
    REMAINING_HEADER,
};
