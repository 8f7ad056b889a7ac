pub mod auth;
pub mod client;
pub mod error_details;

pub use auth::{AuthenticatedUser, resolve_session, session_auth, store_session};
pub use client::ClientContext;
pub use error_details::expose_error_details;
