//! Application state

use std::sync::Arc;

use hookrelay_reconcile::{InvariantChecker, ReconcileServices};
use hookrelay_shared::RateLimiter;

use crate::{
    auth::{AuthState, JwtManager},
    config::Config,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub services: ReconcileServices,
    pub jwt_manager: JwtManager,
    /// Sliding-window limiter, the first gate on every route
    pub rate_limiter: RateLimiter,
    /// Only available on the Postgres store
    pub invariants: Option<Arc<InvariantChecker>>,
}

impl AppState {
    pub fn new(
        config: Config,
        services: ReconcileServices,
        rate_limiter: RateLimiter,
        invariants: Option<Arc<InvariantChecker>>,
    ) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret);

        if config.gateway_access_token.is_empty() {
            tracing::warn!("GATEWAY_ACCESS_TOKEN not set - gateway lookups will be rejected");
        }
        if invariants.is_none() {
            tracing::warn!("Invariant checks disabled (no Postgres store)");
        }

        Self {
            config,
            services,
            jwt_manager,
            rate_limiter,
            invariants,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }
}
