//! Shared error taxonomy and runtime settings for claret.
//!
//! This crate intentionally does not depend on axum or any concrete HTTP
//! client; it only defines the vocabulary the other crates speak.

mod error;
mod settings;

pub use error::{ErrorBody, ErrorDetail, ProxyError};
pub use settings::Settings;

/// Accounts are keyed by the upstream organization uuid.
pub type AccountId = uuid::Uuid;
