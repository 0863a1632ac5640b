//! # phantom-fetch
//!
//! The object-fetch pipeline's HTTP layer: authenticated requests
//! against the remote object service, with retry, exponential backoff
//! with jitter, per-attempt timeouts, and a one-shot credential refresh
//! on 401.

pub mod config_doc;
pub mod creds;
pub mod requester;

pub use config_doc::{CacheServerInfo, ServerGvfsConfig};
pub use creds::{Credential, CredentialSource, CredentialStore, HelperCredentialSource};
pub use requester::{Endpoints, ObjectRequester, RetryPolicy};

use thiserror::Error;

/// Errors surfaced by the fetch pipeline. Cloneable so a single-flight
/// result can be shared with every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("request cancelled")]
    Cancelled,

    #[error("gave up after {attempts} attempts: {detail}")]
    Exhausted { attempts: u32, detail: String },

    #[error("authentication failed: {detail}")]
    Auth { detail: String },

    #[error("object service returned {status}: {detail}")]
    Status { status: u16, detail: String },

    #[error("credential helper failed: {detail}")]
    Credential { detail: String },

    #[error("invalid object service endpoint: {0}")]
    InvalidUrl(String),

    #[error("malformed service response: {detail}")]
    Malformed { detail: String },
}

pub type Result<T> = std::result::Result<T, FetchError>;
