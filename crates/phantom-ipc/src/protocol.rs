//! Request and response vocabulary.
//!
//! Wire form is `Header\0Body`. Unknown request headers are not an
//! error at this layer; they parse to [`Request::Unknown`] so the
//! router can answer `UnknownRequest` instead of dropping the client.

use serde::{Deserialize, Serialize};

use crate::{IpcError, Result};

/// Identity an external `git` process presents when asking for the
/// working-tree lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockData {
    pub pid: u32,
    pub is_elevated: bool,
    /// Probe availability without taking the lock.
    pub check_only: bool,
    /// Short command name, e.g. `git checkout`.
    pub name: String,
    /// Full parsed command line.
    pub args: String,
}

impl LockData {
    fn render(&self) -> String {
        format!(
            "{}\0{}\0{}\0{}\0{}",
            self.pid,
            u8::from(self.is_elevated),
            u8::from(self.check_only),
            self.name,
            self.args
        )
    }

    fn parse(body: &str) -> Result<Self> {
        let mut fields = body.splitn(5, '\0');
        let pid = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| IpcError::malformed("LockData", "bad pid"))?;
        let is_elevated = fields
            .next()
            .map(|s| s == "1")
            .ok_or_else(|| IpcError::malformed("LockData", "missing elevated flag"))?;
        let check_only = fields
            .next()
            .map(|s| s == "1")
            .ok_or_else(|| IpcError::malformed("LockData", "missing check flag"))?;
        let name = fields
            .next()
            .ok_or_else(|| IpcError::malformed("LockData", "missing name"))?
            .to_string();
        let args = fields.next().unwrap_or_default().to_string();
        Ok(Self {
            pid,
            is_elevated,
            check_only,
            name,
            args,
        })
    }
}

/// Requests clients may send. All but `GetStatus` and `Unmount` are
/// refused while the mount is not ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    AcquireLock(LockData),
    ReleaseLock(LockData),
    /// Body is a 40-hex OID.
    DownloadObject { oid: String },
    /// Body is a comma-separated list of commit OIDs.
    Prefetch { commits: Vec<String> },
    GetStatus,
    /// Body is the journal version the client understands.
    ModifiedPaths { version: String },
    /// Body carries opaque flags from the hook.
    PostIndexChanged { flags: String },
    /// Body is a JSON array of pack index paths.
    RunPostFetchJob { pack_indexes: Vec<String> },
    Unmount,
    /// Preserved verbatim so the router can answer `UnknownRequest`.
    Unknown { header: String },
}

impl Request {
    pub fn render(&self) -> String {
        match self {
            Self::AcquireLock(data) => format!("AcquireLock\0{}", data.render()),
            Self::ReleaseLock(data) => format!("ReleaseLock\0{}", data.render()),
            Self::DownloadObject { oid } => format!("DownloadObject\0{oid}"),
            Self::Prefetch { commits } => format!("Prefetch\0{}", commits.join(",")),
            Self::GetStatus => "GetStatus\0".to_string(),
            Self::ModifiedPaths { version } => format!("ModifiedPaths\0{version}"),
            Self::PostIndexChanged { flags } => format!("PostIndexChanged\0{flags}"),
            Self::RunPostFetchJob { pack_indexes } => format!(
                "RunPostFetchJob\0{}",
                serde_json::to_string(pack_indexes).unwrap_or_else(|_| "[]".to_string())
            ),
            Self::Unmount => "Unmount\0".to_string(),
            Self::Unknown { header } => format!("{header}\0"),
        }
    }

    pub fn parse(frame: &str) -> Result<Self> {
        let (header, body) = frame
            .split_once('\0')
            .ok_or_else(|| IpcError::malformed("request", "missing header terminator"))?;
        Ok(match header {
            "AcquireLock" => Self::AcquireLock(LockData::parse(body)?),
            "ReleaseLock" => Self::ReleaseLock(LockData::parse(body)?),
            "DownloadObject" => Self::DownloadObject {
                oid: body.to_string(),
            },
            "Prefetch" => Self::Prefetch {
                commits: body
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            },
            "GetStatus" => Self::GetStatus,
            "ModifiedPaths" => Self::ModifiedPaths {
                version: body.to_string(),
            },
            "PostIndexChanged" => Self::PostIndexChanged {
                flags: body.to_string(),
            },
            "RunPostFetchJob" => Self::RunPostFetchJob {
                pack_indexes: serde_json::from_str(body)
                    .map_err(|e| IpcError::malformed("RunPostFetchJob", e.to_string()))?,
            },
            "Unmount" => Self::Unmount,
            other => Self::Unknown {
                header: other.to_string(),
            },
        })
    }
}

/// The `GetStatus` JSON body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub struct StatusPayload {
    pub enlistment_root: String,
    pub local_cache_root: String,
    pub repo_url: String,
    pub cache_server: String,
    pub lock_status: String,
    pub disk_layout_version: String,
    pub mount_status: String,
    pub background_operation_count: u64,
}

/// Responses the mount process sends.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Accept,
    /// Lock refused: the mount itself holds an implicit write.
    DenyGvfs,
    /// Lock refused: an external holder already owns it.
    DenyGit { holder: String },
    MountNotReady,
    UnmountInProgress,
    Success,
    Failure,
    InvalidSha,
    DownloadFailed,
    InvalidVersion,
    UnknownRequest,
    ModifiedPaths { paths: Vec<String> },
    Status(StatusPayload),
}

impl Response {
    pub fn render(&self) -> String {
        match self {
            Self::Accept => "Accept\0".to_string(),
            Self::DenyGvfs => "Deny\0GVFS".to_string(),
            Self::DenyGit { holder } => format!("Deny\0Git\0{holder}"),
            Self::MountNotReady => "MountNotReady\0".to_string(),
            Self::UnmountInProgress => "UnmountInProgress\0".to_string(),
            Self::Success => "Success\0".to_string(),
            Self::Failure => "Failure\0".to_string(),
            Self::InvalidSha => "InvalidSHA\0".to_string(),
            Self::DownloadFailed => "DownloadFailed\0".to_string(),
            Self::InvalidVersion => "InvalidVersion\0".to_string(),
            Self::UnknownRequest => "UnknownRequest\0".to_string(),
            Self::ModifiedPaths { paths } => {
                let mut body = String::new();
                for path in paths {
                    body.push_str(path);
                    body.push('\0');
                }
                format!("ModifiedPaths\0{body}")
            }
            Self::Status(payload) => format!(
                "Status\0{}",
                serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string())
            ),
        }
    }

    pub fn parse(frame: &str) -> Result<Self> {
        let (header, body) = frame
            .split_once('\0')
            .ok_or_else(|| IpcError::malformed("response", "missing header terminator"))?;
        Ok(match header {
            "Accept" => Self::Accept,
            "Deny" => match body.split_once('\0') {
                Some(("Git", holder)) => Self::DenyGit {
                    holder: holder.to_string(),
                },
                _ if body == "GVFS" => Self::DenyGvfs,
                _ => return Err(IpcError::malformed("response", "bad Deny body")),
            },
            "MountNotReady" => Self::MountNotReady,
            "UnmountInProgress" => Self::UnmountInProgress,
            "Success" => Self::Success,
            "Failure" => Self::Failure,
            "InvalidSHA" => Self::InvalidSha,
            "DownloadFailed" => Self::DownloadFailed,
            "InvalidVersion" => Self::InvalidVersion,
            "UnknownRequest" => Self::UnknownRequest,
            "ModifiedPaths" => Self::ModifiedPaths {
                paths: body
                    .split('\0')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            },
            "Status" => Self::Status(
                serde_json::from_str(body)
                    .map_err(|e| IpcError::malformed("Status", e.to_string()))?,
            ),
            other => {
                return Err(IpcError::malformed("response", format!("unknown header {other}")))
            }
        })
    }
}
