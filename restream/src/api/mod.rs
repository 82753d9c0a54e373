//! HTTP boundary.
//!
//! A thin axum layer over the scheduler: it resolves the caller identity,
//! maps requests onto scheduler operations and errors onto status codes.

pub mod caller;
pub mod error;
pub mod models;
pub mod routes;
pub mod server;

pub use caller::Caller;
pub use error::{ApiError, ApiResult};
pub use server::{ApiServer, ApiServerConfig, AppState};
