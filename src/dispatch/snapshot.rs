use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::backends::{Frame, SnapshotStore};

/// `fall_snapshot_<incident>_<seq>_<YYYYmmdd_HHMMSS>.jpg`
pub fn snapshot_name(incident: u64, seq: u64, at: DateTime<Utc>) -> String {
    format!("fall_snapshot_{}_{:03}_{}.jpg", incident, seq, at.format("%Y%m%d_%H%M%S"))
}

/// Stores frames as files in one directory.
#[derive(Debug, Clone)]
pub struct DirSnapshotStore {
    dir: PathBuf,
}

impl DirSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SnapshotStore for DirSnapshotStore {
    async fn persist(&self, name: &str, frame: &Frame) -> Result<String> {
        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            bail!("invalid snapshot name {:?}", name);
        }
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let path = self.dir.join(name);
        tokio::fs::write(&path, &frame.bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_name_format() {
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(snapshot_name(4, 7, at), "fall_snapshot_4_007_20250102_030405.jpg");
    }

    #[tokio::test]
    async fn test_persist_writes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirSnapshotStore::new(tmp.path().join("snaps"));
        let frame = Frame { bytes: vec![0xff, 0xd8, 0xff] };
        let reference = store.persist("a.jpg", &frame).await.unwrap();
        assert_eq!(reference, "a.jpg");
        let written = std::fs::read(tmp.path().join("snaps").join("a.jpg")).unwrap();
        assert_eq!(written, frame.bytes);
    }

    #[tokio::test]
    async fn test_rejects_path_names() {
        let tmp = tempfile::tempdir().unwrap();
        let store = DirSnapshotStore::new(tmp.path());
        let frame = Frame { bytes: vec![1] };
        assert!(store.persist("../escape.jpg", &frame).await.is_err());
        assert!(store.persist("", &frame).await.is_err());
    }
}
