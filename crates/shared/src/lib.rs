// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Hookrelay Shared Module
//!
//! Building blocks used by every Hookrelay crate:
//!
//! - **Database**: Postgres pool creation and embedded migrations
//! - **Rate Limiting**: sliding-window limiter over a pluggable counter store
//! - **Validation**: field validators and the free-text sanitizer

pub mod db;
pub mod error;
pub mod rate_limit;
pub mod validation;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use error::{SharedError, SharedResult};
pub use rate_limit::{
    client_identifier, InMemoryRateLimitStore, RateLimitDecision, RateLimitProfile,
    RateLimitStore, RateLimiter, RedisRateLimitStore, WindowState, UNKNOWN_CLIENT,
};
pub use validation::{
    batch_validate, sanitize_json, sanitize_string, validate_amount, validate_email,
    validate_items, validate_string_length, validate_uuid, ValidationError,
};
