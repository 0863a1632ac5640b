//! Key-value `.dat` text files.
//!
//! The format backing `RepoMetadata.dat`, `config.dat`, and
//! `mapping.dat`: one `key=value` pair per line, `#` comments, saved
//! atomically (temp file + rename).

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use rand::Rng;

use crate::{ConfigError, Result};

/// An in-memory copy of one `.dat` file.
#[derive(Debug, Clone, Default)]
pub struct KvStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
}

impl KvStore {
    /// Loads an existing file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = fs::read_to_string(&path)?;
        let mut entries = BTreeMap::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Malformed {
                file: path.display().to_string(),
                detail: format!("line {} has no '='", line_no + 1),
            })?;
            entries.insert(key.trim().to_string(), value.trim().to_string());
        }
        Ok(Self { path, entries })
    }

    /// Loads the file if present, otherwise starts empty at `path`.
    pub fn load_or_new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self {
                path: path.to_path_buf(),
                entries: BTreeMap::new(),
            })
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(key.to_string(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Persists atomically: temp file in the same directory, fsync,
    /// rename over the destination.
    pub fn save(&self) -> Result<()> {
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&parent)?;

        let mut content = String::new();
        for (key, value) in &self.entries {
            content.push_str(key);
            content.push('=');
            content.push_str(value);
            content.push('\n');
        }

        let suffix: u32 = rand::thread_rng().gen();
        let tmp = parent.join(format!(".kv_tmp_{suffix:08x}"));
        let mut file = File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn save_load_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("meta.dat");

        let mut store = KvStore::load_or_new(&path).unwrap();
        store.set("enlistmentId", "abc-123");
        store.set("diskLayoutMajor", "1");
        store.save().unwrap();

        let loaded = KvStore::load(&path).unwrap();
        assert_eq!(loaded.get("enlistmentId"), Some("abc-123"));
        assert_eq!(loaded.get_parsed::<u32>("diskLayoutMajor"), Some(1));
    }

    #[test]
    fn comments_and_blank_lines_skipped() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cfg.dat");
        std::fs::write(&path, "# header\n\nkey=value\n  spaced  =  v2  \n").unwrap();

        let store = KvStore::load(&path).unwrap();
        assert_eq!(store.get("key"), Some("value"));
        assert_eq!(store.get("spaced"), Some("v2"));
    }

    #[test]
    fn malformed_line_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("bad.dat");
        std::fs::write(&path, "no equals sign here\n").unwrap();
        assert!(matches!(
            KvStore::load(&path),
            Err(ConfigError::Malformed { .. })
        ));
    }
}
