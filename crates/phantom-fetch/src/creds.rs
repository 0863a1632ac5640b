//! Credential acquisition and caching.
//!
//! Credentials come from an external helper speaking the git-credential
//! wire format (`fill` / `reject` verbs on stdin/stdout). The store
//! caches one credential per repo URL; a 401 revokes the cached value
//! through the helper before the single retry.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{FetchError, Result};

/// A credential as presented to the object service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl Credential {
    /// Value for the `Authorization` header.
    pub fn authorization_value(&self) -> String {
        match self {
            Self::Basic { username, password } => {
                let encoded = BASE64.encode(format!("{username}:{password}"));
                format!("Basic {encoded}")
            }
            Self::Bearer { token } => format!("Bearer {token}"),
        }
    }
}

/// Where credentials come from. The production source shells out to the
/// configured helper; tests substitute a canned source.
pub trait CredentialSource: Send + Sync {
    fn fill(&self, url: &str) -> Result<Credential>;
    fn reject(&self, url: &str) -> Result<()>;
}

/// Invokes the external credential helper binary.
pub struct HelperCredentialSource {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl HelperCredentialSource {
    /// A standalone helper binary taking the verb as its only argument.
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// The shipped Git binary as the helper: `git credential <verb>`.
    pub fn via_git<P: Into<PathBuf>>(git_binary: P) -> Self {
        Self {
            program: git_binary.into(),
            leading_args: vec!["credential".to_string()],
        }
    }

    fn invoke(&self, verb: &str, url: &str) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.leading_args)
            .arg(verb)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| FetchError::Credential {
                detail: format!("failed to spawn {}: {e}", self.program.display()),
            })?;

        if let Some(stdin) = child.stdin.as_mut() {
            let input = format!("url={url}\n\n");
            stdin
                .write_all(input.as_bytes())
                .map_err(|e| FetchError::Credential {
                    detail: format!("helper stdin: {e}"),
                })?;
        }

        let output = child.wait_with_output().map_err(|e| FetchError::Credential {
            detail: format!("helper wait: {e}"),
        })?;
        if !output.status.success() {
            return Err(FetchError::Credential {
                detail: format!("helper {verb} exited with {}", output.status),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl CredentialSource for HelperCredentialSource {
    fn fill(&self, url: &str) -> Result<Credential> {
        let output = self.invoke("fill", url)?;
        let mut username = None;
        let mut password = None;
        for line in output.lines() {
            match line.split_once('=') {
                Some(("username", value)) => username = Some(value.to_string()),
                Some(("password", value)) => password = Some(value.to_string()),
                _ => {}
            }
        }
        match (username, password) {
            // An empty username means the helper produced a raw token.
            (Some(username), Some(password)) if username.is_empty() => {
                Ok(Credential::Bearer { token: password })
            }
            (Some(username), Some(password)) => Ok(Credential::Basic { username, password }),
            _ => Err(FetchError::Credential {
                detail: "helper returned no credential".to_string(),
            }),
        }
    }

    fn reject(&self, url: &str) -> Result<()> {
        self.invoke("reject", url).map(|_| ())
    }
}

/// Per-URL credential cache over a source.
#[derive(Clone)]
pub struct CredentialStore {
    source: Arc<dyn CredentialSource>,
    cache: Arc<Mutex<HashMap<String, Credential>>>,
}

impl CredentialStore {
    pub fn new(source: Arc<dyn CredentialSource>) -> Self {
        Self {
            source,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Cached credential for `url`, filling through the source on miss.
    pub fn get(&self, url: &str) -> Result<Credential> {
        if let Some(credential) = self.cache.lock().get(url) {
            return Ok(credential.clone());
        }
        let credential = self.source.fill(url)?;
        debug!(url, "credential filled");
        self.cache.lock().insert(url.to_string(), credential.clone());
        Ok(credential)
    }

    /// Drops the cached credential and tells the helper it was bad.
    pub fn revoke(&self, url: &str) {
        self.cache.lock().remove(url);
        if let Err(e) = self.source.reject(url) {
            warn!(url, error = %e, "credential reject failed");
        }
    }
}
