//! Durable storage of membership snapshots.
//!
//! The log and checkpoint machinery of the database live elsewhere; this is
//! the narrow contract the membership service needs: persist a snapshot that
//! already satisfies every group invariant, and load the last one back.

use repgroup_shared::{FormatError, GroupMembership};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// File name of the stored group inside the data directory
pub const GROUP_FILE: &str = "group.hex";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("snapshot I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stored snapshot is corrupt: {0}")]
    Format(#[from] FormatError),
}

pub trait SnapshotStore: Send + Sync {
    fn load(&self) -> Result<Option<GroupMembership>, StoreError>;

    fn save(&self, group: &GroupMembership) -> Result<(), StoreError>;
}

/// Hex stream in a single file, replaced atomically on every save
#[derive(Debug, Clone)]
pub struct HexFileStore {
    path: PathBuf,
}

impl HexFileStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(GROUP_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl SnapshotStore for HexFileStore {
    fn load(&self) -> Result<Option<GroupMembership>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        let group = GroupMembership::from_hex(content.trim())?;
        debug!(
            "loaded group {} (change {}) from {}",
            group.name(),
            group.change_version(),
            self.path.display()
        );
        Ok(Some(group))
    }

    fn save(&self, group: &GroupMembership) -> Result<(), StoreError> {
        let hex = group.to_hex()?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;
        }

        let tmp = self.path.with_extension("hex.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(hex.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| self.io_err(e))?;
        debug!("saved group change {} to {}", group.change_version(), self.path.display());
        Ok(())
    }
}

/// Keeps the last saved stream in memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    stream: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream(&self) -> Option<String> {
        self.stream.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self) -> Result<Option<GroupMembership>, StoreError> {
        match self.stream() {
            Some(stream) => Ok(Some(GroupMembership::from_hex(&stream)?)),
            None => Ok(None),
        }
    }

    fn save(&self, group: &GroupMembership) -> Result<(), StoreError> {
        let hex = group.to_hex()?;
        *self.stream.lock().unwrap_or_else(|e| e.into_inner()) = Some(hex);
        Ok(())
    }
}
