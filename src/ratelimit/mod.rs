//! Rate limiting logic and state management.

mod backend;
pub mod clock;
mod distributed;
mod limiter;
pub mod log;
mod redis_store;
pub mod store;
mod sweeper;
mod window;

pub use backend::RateLimiterBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::{DistributedRateLimiter, FailurePolicy, DEFAULT_STORE_TIMEOUT};
pub use limiter::RateLimiter;
pub use log::{LogView, RequestLog};
pub use redis_store::{RedisStore, RedisStoreConfig};
pub use store::RateLimitStore;
pub use sweeper::Sweeper;
pub use window::{LimitConfig, RateLimitDecision, DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW_MS};
