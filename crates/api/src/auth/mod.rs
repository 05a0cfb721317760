//! Admin authentication

pub mod jwt;
pub mod middleware;

pub use jwt::{Claims, JwtManager};
pub use middleware::{
    authenticate_admin, require_admin, AdminUser, AuthError, AuthState, ADMIN_ROLES,
};
