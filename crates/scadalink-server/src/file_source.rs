//! RTU descriptor list read from a JSON file.
//!
//! The file holds an array of descriptors:
//!
//! ```json
//! [
//!   { "RTU": "10.0.0.5:2404", "enabled": true, "IFS": "IFS_A" },
//!   { "RTU": "10.0.0.6", "enabled": 0, "IFS": "IFS_A" }
//! ]
//! ```
//!
//! Entries that fail to decode are rejected one by one; the remaining
//! entries are still loaded. Changes are detected by polling the file's
//! modification time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use scadalink_core::DescriptorList;

use crate::backend::{DesiredStateSource, StoreResult};
use crate::error::StoreError;

pub struct FileDesiredState {
    path: PathBuf,
    revision: watch::Sender<u64>,
}

impl FileDesiredState {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            path: path.into(),
            revision,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
            .ok()
    }

    /// Bump the revision whenever the file's modification time changes.
    pub async fn watch_file(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut last = self.modified().await;
        let mut ticker = tokio::time::interval(interval);
        info!(path = %self.path.display(), "Watching RTU list");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let current = self.modified().await;
                    if current != last {
                        debug!(path = %self.path.display(), "RTU list changed");
                        last = current;
                        self.revision.send_modify(|rev| *rev += 1);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl DesiredStateSource for FileDesiredState {
    async fn load(&self) -> StoreResult<DescriptorList> {
        let json = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| StoreError::Unavailable(format!("{}: {e}", self.path.display())))?;
        DescriptorList::from_json_str(&json)
            .map_err(|e| StoreError::Decode(format!("{}: {e}", self.path.display())))
    }

    fn watch(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use scadalink_core::{ConfigIssue, RtuDescriptor};

    fn temp_path() -> PathBuf {
        std::env::temp_dir().join(format!("scadalink-rtus-{}.json", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn test_load_descriptors() {
        let path = temp_path();
        std::fs::write(
            &path,
            r#"[{"RTU": "10.0.0.5:2404", "enabled": true, "IFS": "IFS_A"},
                {"RTU": "10.0.0.6", "enabled": 0, "IFS": "IFS_A"}]"#,
        )
        .unwrap();

        let source = FileDesiredState::new(&path);
        let list = source.load().await.unwrap();
        assert!(list.rejected.is_empty());
        assert_eq!(
            list.descriptors,
            vec![
                RtuDescriptor::new("10.0.0.5:2404", true, "IFS_A"),
                RtuDescriptor::new("10.0.0.6", false, "IFS_A"),
            ]
        );
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_bad_entry_does_not_hide_the_rest() {
        let path = temp_path();
        std::fs::write(
            &path,
            r#"[{"RTU": "10.0.0.1", "enabled": true, "IFS": "IFS_A"},
                {"RTU": "10.0.0.2", "enabled": 2, "IFS": "IFS_A"}]"#,
        )
        .unwrap();

        let list = FileDesiredState::new(&path).load().await.unwrap();
        assert_eq!(list.descriptors, vec![RtuDescriptor::new("10.0.0.1", true, "IFS_A")]);
        assert_eq!(list.rejected.len(), 1);
        assert!(matches!(
            &list.rejected[0],
            ConfigIssue::Malformed { address, .. } if address == "10.0.0.2"
        ));
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_missing_and_invalid_file() {
        let path = temp_path();
        let source = FileDesiredState::new(&path);
        assert!(matches!(source.load().await, Err(StoreError::Unavailable(_))));

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(source.load().await, Err(StoreError::Decode(_))));
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_watch_detects_creation() {
        let path = temp_path();
        let source = Arc::new(FileDesiredState::new(&path));
        let mut rx = source.watch();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(
            source
                .clone()
                .watch_file(Duration::from_millis(10), cancel.clone()),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        std::fs::write(&path, "[]").unwrap();
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();

        cancel.cancel();
        handle.await.unwrap();
        std::fs::remove_file(&path).unwrap();
    }
}
