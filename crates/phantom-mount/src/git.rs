//! `git` sub-process invocation.
//!
//! Everything beyond index projection and object I/O goes through the
//! shipped Git binary. Maintenance steps depend on the [`GitRunner`]
//! trait so tests can substitute a recording fake.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum GitError {
    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("git {args} exited with {code}: {stderr}")]
    NonZero {
        args: String,
        code: i32,
        stdout: String,
        stderr: String,
    },
}

/// Captured output of a successful invocation.
#[derive(Debug, Clone, Default)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

/// The seam maintenance steps call git through.
pub trait GitRunner: Send + Sync {
    fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<GitOutput, GitError>;
}

/// Production runner: invokes the configured binary inside the
/// enlistment root.
pub struct GitProcess {
    binary: PathBuf,
    work_dir: PathBuf,
}

impl GitProcess {
    pub fn new(binary: PathBuf, work_dir: PathBuf) -> Self {
        Self { binary, work_dir }
    }
}

impl GitRunner for GitProcess {
    fn run(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<GitOutput, GitError> {
        debug!(args = ?args, "running git");
        let mut child = Command::new(&self.binary)
            .args(args)
            .current_dir(&self.work_dir)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let (Some(bytes), Some(pipe)) = (stdin, child.stdin.as_mut()) {
            pipe.write_all(bytes)?;
        }
        drop(child.stdin.take());

        let output = child.wait_with_output()?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(GitError::NonZero {
                args: args.join(" "),
                code: output.status.code().unwrap_or(-1),
                stdout,
                stderr,
            });
        }
        Ok(GitOutput { stdout, stderr })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A recording fake used across maintenance tests.

    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct RecordingGit {
        pub invocations: Mutex<Vec<Vec<String>>>,
        /// Non-empty: pop one result per call (front first).
        pub scripted: Mutex<Vec<Result<GitOutput, GitError>>>,
    }

    impl RecordingGit {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn call_count(&self) -> usize {
            self.invocations.lock().len()
        }
    }

    impl GitRunner for RecordingGit {
        fn run(&self, args: &[&str], _stdin: Option<&[u8]>) -> Result<GitOutput, GitError> {
            self.invocations
                .lock()
                .push(args.iter().map(|s| s.to_string()).collect());
            let mut scripted = self.scripted.lock();
            if scripted.is_empty() {
                Ok(GitOutput::default())
            } else {
                scripted.remove(0)
            }
        }
    }
}
