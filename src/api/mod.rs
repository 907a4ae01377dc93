//! Thin HTTP adapter over the core services.
//!
//! Handlers validate input, call one core operation, and map typed errors
//! to status codes. No business logic lives here.

mod routes;

pub use routes::{router, AppState};
