use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::Builder;

use crate::domain::EntityId;
use crate::error::MirrorError;
use crate::reader::{FrameMark, ResumePoint};

/// Durable import progress.
///
/// `byte_offset` is the decompressed offset of the first record that is not
/// yet committed; it only moves after the store commit for the records
/// before it has returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCheckpoint {
    pub byte_offset: u64,
    pub entities_committed: u64,
    #[serde(default)]
    pub frame: FrameMark,
    #[serde(default)]
    pub last_id: Option<EntityId>,
    #[serde(default)]
    pub dump_len: Option<u64>,
    #[serde(default)]
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl ImportCheckpoint {
    pub fn resume_point(&self) -> ResumePoint {
        ResumePoint {
            byte_offset: self.byte_offset,
            frame: self.frame,
        }
    }

    pub fn validate(&self) -> Result<(), MirrorError> {
        if self.frame.decompressed_offset > self.byte_offset {
            return Err(MirrorError::Checkpoint(format!(
                "frame starts at {} past checkpoint offset {}",
                self.frame.decompressed_offset, self.byte_offset
            )));
        }
        if self.byte_offset == 0 && self.entities_committed > 0 {
            return Err(MirrorError::Checkpoint(format!(
                "{} entities committed but offset is 0",
                self.entities_committed
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct CheckpointStore {
    path: Utf8PathBuf,
    last_saved: Option<(u64, u64)>,
}

impl CheckpointStore {
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_saved: None,
        }
    }

    /// `<db>.progress.json` next to the database file.
    pub fn for_database(database_path: &Utf8Path) -> Self {
        Self::new(database_path.with_extension("progress.json"))
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn load(&mut self) -> Result<Option<ImportCheckpoint>, MirrorError> {
        let content = match fs::read(self.path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(MirrorError::Checkpoint(format!(
                    "read {}: {err}",
                    self.path
                )));
            }
        };
        let checkpoint: ImportCheckpoint = serde_json::from_slice(&content)
            .map_err(|err| MirrorError::Checkpoint(format!("parse {}: {err}", self.path)))?;
        checkpoint.validate()?;
        self.last_saved = Some((checkpoint.byte_offset, checkpoint.entities_committed));
        Ok(Some(checkpoint))
    }

    /// Write-to-temp, fsync, rename, fsync parent.
    pub fn save(&mut self, checkpoint: &ImportCheckpoint) -> Result<(), MirrorError> {
        checkpoint.validate()?;
        if let Some((offset, committed)) = self.last_saved {
            if checkpoint.byte_offset < offset || checkpoint.entities_committed < committed {
                return Err(MirrorError::Checkpoint(format!(
                    "refusing to move checkpoint backwards ({offset}/{committed} -> {}/{})",
                    checkpoint.byte_offset, checkpoint.entities_committed
                )));
            }
        }

        let parent = self
            .path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| MirrorError::Checkpoint(err.to_string()))?;

        let content = serde_json::to_vec_pretty(checkpoint)
            .map_err(|err| MirrorError::Checkpoint(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix(".checkpoint")
            .suffix(".tmp")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| MirrorError::Checkpoint(err.to_string()))?;
        temp.write_all(&content)
            .map_err(|err| MirrorError::Checkpoint(err.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| MirrorError::Checkpoint(err.to_string()))?;
        temp.persist(self.path.as_std_path())
            .map_err(|err| MirrorError::Checkpoint(err.to_string()))?;
        sync_dir(parent)?;

        self.last_saved = Some((checkpoint.byte_offset, checkpoint.entities_committed));
        Ok(())
    }

    pub fn clear(&mut self) -> Result<(), MirrorError> {
        match fs::remove_file(self.path.as_std_path()) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(MirrorError::Checkpoint(err.to_string())),
        }
        self.last_saved = None;
        Ok(())
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Utf8Path) -> Result<(), MirrorError> {
    fs::File::open(dir.as_std_path())
        .and_then(|handle| handle.sync_all())
        .map_err(|err| MirrorError::Checkpoint(format!("sync {dir}: {err}")))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Utf8Path) -> Result<(), MirrorError> {
    Ok(())
}
