use crate::error::AppError;
use crate::models::{SnapshotDocument, StatisticsSnapshot};
use std::fs;
use std::path::PathBuf;

/// Hands out an immutable, internally consistent copy of recorded usage.
pub trait SnapshotSource {
    fn snapshot(&self) -> Result<StatisticsSnapshot, AppError>;
}

impl SnapshotSource for StatisticsSnapshot {
    fn snapshot(&self) -> Result<StatisticsSnapshot, AppError> {
        Ok(self.clone())
    }
}

/// A usage export written by the proxy, read fresh on every call.
pub struct JsonSnapshotFile {
    path: PathBuf,
}

impl JsonSnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotSource for JsonSnapshotFile {
    fn snapshot(&self) -> Result<StatisticsSnapshot, AppError> {
        let raw = fs::read_to_string(&self.path)?;
        let doc: SnapshotDocument = serde_json::from_str(&raw)?;
        Ok(doc.into_snapshot())
    }
}
