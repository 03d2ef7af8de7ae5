//! Durable state documents
//!
//! Each engine owns exactly one state file and overwrites it in full after
//! every cycle. On restart the last document is read back verbatim.

use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// JSON document holding an engine's full state
#[derive(Debug, Clone)]
pub struct StateFile<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateFile<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Overwrite the document with the current state. The body goes to a
    /// sibling `.tmp` file first and is renamed over the document.
    pub async fn save(&self, state: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let body = serde_json::to_vec_pretty(state)?;
        let tmp = self.tmp_path();
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("State written to {}", self.path.display());
        Ok(())
    }

    /// Read the last document back; None when no snapshot exists yet
    pub async fn load(&self) -> Result<Option<T>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Like `load`, but an unreadable snapshot is logged and treated as absent
    pub async fn load_or_none(&self) -> Option<T> {
        match self.load().await {
            Ok(state) => state,
            Err(e) => {
                warn!(
                    "Ignoring unreadable state file {}: {}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        cycle: u32,
        name: String,
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::<Doc>::new(dir.path().join("nested/state.json"));

        assert!(file.load().await.unwrap().is_none());

        file.save(&Doc { cycle: 1, name: "a".into() }).await.unwrap();
        file.save(&Doc { cycle: 2, name: "b".into() }).await.unwrap();

        let loaded = file.load().await.unwrap().unwrap();
        assert_eq!(loaded, Doc { cycle: 2, name: "b".into() });
        assert!(!dir.path().join("nested/state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_stale_tmp_does_not_shadow_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(dir.path().join("state.json.tmp"), b"{half").await.unwrap();

        let file = StateFile::<Doc>::new(&path);
        file.save(&Doc { cycle: 7, name: "c".into() }).await.unwrap();
        assert_eq!(file.load().await.unwrap().unwrap().cycle, 7);
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let file = StateFile::<Doc>::new(&path);
        assert!(file.load().await.is_err());
        assert!(file.load_or_none().await.is_none());
    }
}
