use crate::error::SyncError;
use crate::types::DownloadMetadataEntry;
use log::debug;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub type Entries = BTreeMap<String, DownloadMetadataEntry>;

/// JSON file of dataset name -> last successful download.
///
/// The file is read once on `load` and rewritten whole on every change.
/// Writes go through a temporary file and a rename, so a reader never sees
/// a half-written document.
#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl MetadataStore {
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, SyncError> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                SyncError::Metadata(format!("corrupt metadata file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Entries::new(),
            Err(e) => return Err(SyncError::Io(e)),
        };
        debug!(
            "Loaded {} metadata entries from {}",
            entries.len(),
            path.display()
        );
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, dataset: &str) -> Option<DownloadMetadataEntry> {
        self.entries.lock().await.get(dataset).cloned()
    }

    pub async fn entries(&self) -> Entries {
        self.entries.lock().await.clone()
    }

    pub async fn record(
        &self,
        dataset: &str,
        entry: DownloadMetadataEntry,
    ) -> Result<(), SyncError> {
        let mut entries = self.entries.lock().await;
        let previous = entries.insert(dataset.to_string(), entry);
        if let Err(e) = write_atomic(&self.path, &entries).await {
            match previous {
                Some(old) => entries.insert(dataset.to_string(), old),
                None => entries.remove(dataset),
            };
            return Err(e);
        }
        Ok(())
    }
}

async fn write_atomic(path: &Path, entries: &Entries) -> Result<(), SyncError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let content =
        serde_json::to_vec_pretty(entries).map_err(|e| SyncError::Metadata(e.to_string()))?;
    let tmp_path = path.with_extension("json.tmp");

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(&content).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}
