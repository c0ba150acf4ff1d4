mod admin;
pub mod config;
pub mod rate_limit;
pub mod search;
mod server;

pub use config::*;
pub use rate_limit::{ClientRateLimiter, RateLimitConfigError, RateLimitExceeded};
pub use search::*;
pub use server::{
    ApiState, ApiStateHandle, DynAnalyticsReader, DynVisualSearch, ServerError, build_api_router,
    build_app_router, serve,
};
