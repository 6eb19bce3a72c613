pub mod app;
pub mod caps;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod gate;
pub mod idempotency;
pub mod metrics;
pub mod rate_limit;
pub mod trending;
pub mod user_agent;
