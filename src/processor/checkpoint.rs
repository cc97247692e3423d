//! Intermediate progress checkpoints
//!
//! After every round a checkpointing processor gets the range's first key and
//! the last key seen saved. The file format is the two keys joined by `\x03`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const SEPARATOR: char = '\x03';

/// Receives per-round progress
pub trait CheckpointSink: Send {
    fn save(&mut self, range_first_key: &str, last_key: &str) -> io::Result<()>;
}

/// A saved checkpoint
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Checkpoint {
    pub range_first_key: String,
    pub last_key: String,
}

/// Checkpoint file on local disk
#[derive(Debug, Clone)]
pub struct FileCheckpoint {
    path: PathBuf,
}

impl FileCheckpoint {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Checkpoint file for a worker identity inside a directory
    pub fn for_identity(dir: &Path, identity: &str) -> Self {
        let safe: String = identity
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Self::new(dir.join(format!("progress-{}", safe)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the last checkpoint; a missing or malformed file yields empty keys
    pub fn load(&self) -> io::Result<Checkpoint> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Checkpoint::default()),
            Err(e) => return Err(e),
        };

        let parts: Vec<&str> = contents.split(SEPARATOR).collect();
        if parts.len() != 2 {
            return Ok(Checkpoint::default());
        }
        Ok(Checkpoint {
            range_first_key: parts[0].to_string(),
            last_key: parts[1].to_string(),
        })
    }
}

impl CheckpointSink for FileCheckpoint {
    fn save(&mut self, range_first_key: &str, last_key: &str) -> io::Result<()> {
        fs::write(&self.path, format!("{}{}{}", range_first_key, SEPARATOR, last_key))
    }
}
