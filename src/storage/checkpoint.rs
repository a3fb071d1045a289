use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::StoreKind;
use crate::traits::StorageResult;
use crate::types::NodeId;

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Election and progress fields that must survive a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub term: u64,
    pub voted_for: Option<NodeId>,
    pub voted_term: u64,
    pub commit_id: u64,
    pub applied_id: u64,
}

/// Reads and atomically replaces `<base>/checkpoint.json`.
///
/// The memory backend has no checkpoint file; loads return `None` and saves
/// succeed without writing.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: Option<PathBuf>,
}

impl CheckpointStore {
    pub fn new(kind: StoreKind, base_dir: &Path) -> Self {
        let path = match kind {
            StoreKind::File => Some(base_dir.join(CHECKPOINT_FILE)),
            StoreKind::Memory => None,
        };
        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load(&self) -> StorageResult<Option<Checkpoint>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(path)?;
        let checkpoint: Checkpoint = serde_json::from_slice(&raw)?;
        info!("Loaded checkpoint {:?} from {:?}", checkpoint, path);
        Ok(Some(checkpoint))
    }

    /// Write to a temporary file, sync it, then rename over the old one.
    pub fn save(&self, checkpoint: &Checkpoint) -> StorageResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(checkpoint)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!("Saved checkpoint {:?}", checkpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_checkpoint_loads_none() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(StoreKind::File, dir.path());
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(StoreKind::File, dir.path());
        let checkpoint = Checkpoint {
            term: 3,
            voted_for: Some("n2".to_string()),
            voted_term: 3,
            commit_id: 10,
            applied_id: 9,
        };
        store.save(&checkpoint).unwrap();
        store.save(&checkpoint).unwrap();
        assert_eq!(store.load().unwrap(), Some(checkpoint));
        assert!(!dir.path().join("checkpoint.json.tmp").exists());
    }

    #[test]
    fn test_memory_backend_keeps_nothing() {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(StoreKind::Memory, dir.path());
        store.save(&Checkpoint::default()).unwrap();
        assert_eq!(store.load().unwrap(), None);
        assert!(store.path().is_none());
    }
}
