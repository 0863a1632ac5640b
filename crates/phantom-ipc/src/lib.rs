//! # phantom-ipc
//!
//! The per-enlistment pipe protocol. Every message is one frame: a
//! little-endian `u32` length prefix followed by UTF-8 text of the form
//! `Header\0Body`, where the body may itself carry NUL-separated fields.
//!
//! Hook processes and the CLI speak this protocol to the mount process;
//! the mount process is always the server.

pub mod client;
pub mod frame;
pub mod protocol;

pub use client::PipeClient;
pub use frame::{read_frame, write_frame, MAX_FRAME_LEN};
pub use protocol::{LockData, Request, Response, StatusPayload};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    #[error("frame is not valid UTF-8")]
    NotText,

    #[error("malformed {what}: {detail}")]
    Malformed { what: &'static str, detail: String },

    #[error("peer closed the connection")]
    Disconnected,
}

impl IpcError {
    pub(crate) fn malformed(what: &'static str, detail: impl Into<String>) -> Self {
        Self::Malformed {
            what,
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IpcError>;
