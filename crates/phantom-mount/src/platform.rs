//! Platform capability layer and the kernel filter seam.
//!
//! File-system primitives the callbacks need vary by OS; they sit
//! behind [`PlatformCapabilities`] with one implementation per target.
//! The kernel filter driver itself ships separately and is reached only
//! through [`VirtualFilter`].

use std::fs::File;
use std::io;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::callbacks::VirtualizationSurface;

/// OS-specific primitives.
pub trait PlatformCapabilities: Send + Sync {
    /// Replaces `to` with `from` atomically where the OS allows it.
    fn move_and_overwrite(&self, from: &Path, to: &Path) -> io::Result<()>;
    /// Flushes file buffers to stable storage.
    fn flush(&self, file: &File) -> io::Result<()>;
    /// Whether `path` is a symlink (without following it).
    fn is_symlink(&self, path: &Path) -> io::Result<bool>;
    /// Whether the file system carries POSIX mode bits.
    fn supports_file_mode(&self) -> bool;
    /// Whether the serialized status cache is usable here.
    fn supports_status_cache(&self) -> bool;
}

/// POSIX implementation.
pub struct UnixPlatform;

impl PlatformCapabilities for UnixPlatform {
    fn move_and_overwrite(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn flush(&self, file: &File) -> io::Result<()> {
        file.sync_all()
    }

    fn is_symlink(&self, path: &Path) -> io::Result<bool> {
        Ok(std::fs::symlink_metadata(path)?.file_type().is_symlink())
    }

    fn supports_file_mode(&self) -> bool {
        true
    }

    fn supports_status_cache(&self) -> bool {
        true
    }
}

/// The running platform's capabilities.
pub fn current() -> Arc<dyn PlatformCapabilities> {
    Arc::new(UnixPlatform)
}

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("kernel filter driver is not installed")]
    DriverMissing,

    #[error("filter attach failed: {0}")]
    Attach(String),
}

/// The opaque kernel filter module. It calls back into the
/// virtualization surface for every intercepted file-system request.
pub trait VirtualFilter: Send + Sync {
    fn start(&self, surface: Arc<VirtualizationSurface>) -> Result<(), FilterError>;
    fn stop(&self);
}

/// Attaches the platform's filter driver.
///
/// The driver is an external collaborator; this build has none linked,
/// so attachment reports it missing and the caller decides whether an
/// IPC-only mount (development, tests) is acceptable.
pub fn attach_filter() -> Result<Box<dyn VirtualFilter>, FilterError> {
    Err(FilterError::DriverMissing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn unix_platform_moves_and_overwrites() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("from.txt");
        let to = temp.path().join("to.txt");
        std::fs::write(&from, b"new").unwrap();
        std::fs::write(&to, b"old").unwrap();

        UnixPlatform.move_and_overwrite(&from, &to).unwrap();
        assert_eq!(std::fs::read(&to).unwrap(), b"new");
        assert!(!from.exists());
    }

    #[test]
    fn unix_platform_detects_symlinks() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("target");
        let mut file = File::create(&target).unwrap();
        file.write_all(b"x").unwrap();

        #[cfg(unix)]
        {
            let link = temp.path().join("link");
            std::os::unix::fs::symlink(&target, &link).unwrap();
            assert!(UnixPlatform.is_symlink(&link).unwrap());
            assert!(!UnixPlatform.is_symlink(&target).unwrap());
        }
    }

    #[test]
    fn filter_attach_reports_missing_driver() {
        assert!(matches!(attach_filter(), Err(FilterError::DriverMissing)));
    }
}
