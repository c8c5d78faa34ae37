use anyhow::Context;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Durable key-value slots the conversation store is mirrored into.
///
/// Reads happen once at startup; writes happen after every committed mutation.
pub trait StorageProvider: Send {
    /// Returns the raw contents of `slot`, or `None` if nothing was saved yet.
    fn read(&self, slot: &str) -> Result<Option<String>, anyhow::Error>;

    /// Replaces the contents of `slot`.
    fn write(&mut self, slot: &str, value: &str) -> Result<(), anyhow::Error>;

    /// Removes `slot`. Removing a missing slot is not an error.
    fn remove(&mut self, slot: &str) -> Result<(), anyhow::Error>;
}

/// Stores each slot as `<dir>/<slot>.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Creates a new FileStorage rooted at `dir`, creating the directory if needed.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create data directory {}", dir.display()))?;
        log::info!("Using data directory: {}", dir.display());
        Ok(Self { dir })
    }

    fn slot_path(&self, slot: &str) -> PathBuf {
        self.dir.join(format!("{}.json", slot))
    }
}

impl StorageProvider for FileStorage {
    fn read(&self, slot: &str) -> Result<Option<String>, anyhow::Error> {
        let path = self.slot_path(slot);
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                log::debug!("Read {} bytes from {}", contents.len(), path.display());
                Ok(Some(contents))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No saved data at {}", path.display());
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    fn write(&mut self, slot: &str, value: &str) -> Result<(), anyhow::Error> {
        let path = self.slot_path(slot);
        // Write to a sibling file first so a crash never leaves a half-written slot
        let tmp_path = self.dir.join(format!("{}.json.tmp", slot));
        std::fs::write(&tmp_path, value)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("Failed to move {} into place", tmp_path.display()))?;
        log::debug!("Wrote {} bytes to {}", value.len(), path.display());
        Ok(())
    }

    fn remove(&mut self, slot: &str) -> Result<(), anyhow::Error> {
        let path = self.slot_path(slot);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                log::warn!("Removed saved data at {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
        }
    }
}

/// In-memory slots. Clones share the same slots, so a test can hand one clone
/// to a store and inspect or reload from another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    slots: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageProvider for MemoryStorage {
    fn read(&self, slot: &str) -> Result<Option<String>, anyhow::Error> {
        Ok(self.slots().get(slot).cloned())
    }

    fn write(&mut self, slot: &str, value: &str) -> Result<(), anyhow::Error> {
        self.slots().insert(slot.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, slot: &str) -> Result<(), anyhow::Error> {
        self.slots().remove(slot);
        Ok(())
    }
}
