//! The API layer, containing web handlers and routing.

pub mod account;
pub mod admin;
pub mod extract;
pub mod handlers;
pub mod router;

pub use admin::ReconcileParams;
pub use extract::{ADMIN_KEY_HEADER, AdminKey, ApiJson, AuthenticatedUser, OptionalUser};
pub use handlers::ApiDoc;
pub use router::{
    RateLimitConfig, RouterConfig, build_router, create_router, create_router_with_rate_limit,
};
