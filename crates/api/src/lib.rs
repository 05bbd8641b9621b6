//! StageRight API Library
//!
//! HTTP surface for the entitlement engine: webhook intake, cancellation,
//! credit consumption, and the admin reconciliation tooling.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
