//! Mount-level error taxonomy.
//!
//! Every failure in the mount process maps onto one of these kinds;
//! the kind decides how it propagates: transient errors retry, auth
//! errors surface after one refresh, corruption is fatal for the
//! operation but not the mount, precondition violations become typed
//! IPC responses, external errors carry the sub-process output, and
//! fatal errors take the mount down after flushing logs.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("authentication failure: {0}")]
    Auth(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("{command} exited with {code}: {stderr}")]
    External {
        command: String,
        code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("kernel filter driver is not installed")]
    FilterMissing,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<crate::blob_sizes::BlobSizesError> for MountError {
    fn from(err: crate::blob_sizes::BlobSizesError) -> Self {
        match err {
            crate::blob_sizes::BlobSizesError::Io(e) => Self::Io(e),
            other => Self::Fatal(other.to_string()),
        }
    }
}

impl From<phantom_odb::OdbError> for MountError {
    fn from(err: phantom_odb::OdbError) -> Self {
        use phantom_odb::OdbError;
        match err {
            OdbError::Io(e) => Self::Io(e),
            OdbError::NotFound { oid } => Self::Transient(format!("object {oid} not present")),
            OdbError::Corrupt { detail } => Self::Corruption(detail),
            OdbError::BadOid { input } => Self::Precondition(format!("bad oid {input:?}")),
            OdbError::UnsupportedVersion { what, version } => {
                Self::Corruption(format!("unsupported {what} version {version}"))
            }
        }
    }
}

impl From<phantom_fetch::FetchError> for MountError {
    fn from(err: phantom_fetch::FetchError) -> Self {
        use phantom_fetch::FetchError;
        match err {
            FetchError::Auth { detail } => Self::Auth(detail),
            FetchError::Cancelled => Self::Transient("fetch cancelled".to_string()),
            other => Self::Transient(other.to_string()),
        }
    }
}

impl From<phantom_index::IndexError> for MountError {
    fn from(err: phantom_index::IndexError) -> Self {
        use phantom_index::IndexError;
        match err {
            IndexError::Io(e) => Self::Io(e),
            IndexError::Corrupt { detail } => Self::Corruption(format!("index: {detail}")),
            IndexError::UnsupportedVersion { version } => {
                Self::Precondition(format!("index version {version} is not supported"))
            }
        }
    }
}

impl From<phantom_journal::JournalError> for MountError {
    fn from(err: phantom_journal::JournalError) -> Self {
        use phantom_journal::JournalError;
        match err {
            JournalError::Io(e) => Self::Io(e),
            JournalError::UnsupportedVersion { found } => {
                Self::Precondition(format!("modified-paths journal version {found}"))
            }
        }
    }
}

impl From<phantom_config::ConfigError> for MountError {
    fn from(err: phantom_config::ConfigError) -> Self {
        use phantom_config::ConfigError;
        match err {
            ConfigError::Io(e) => Self::Io(e),
            ConfigError::DiskLayoutMismatch { found, min, max } => Self::Precondition(format!(
                "disk layout {found} outside supported range {min}..={max}"
            )),
            other => Self::Precondition(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, MountError>;

/// Process exit codes.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERIC_FAILURE: i32 = 1;
    pub const INVALID_REQUEST: i32 = 2;
    pub const REBASELINE_REQUIRED: i32 = 3;
    pub const FILTER_DRIVER_MISSING: i32 = 4;
    pub const MOUNT_POINT_INVALID: i32 = 5;
}
