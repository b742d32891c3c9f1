use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One downloadable extract known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
    pub estimated_size: String,
    pub priority: u32,
}

impl DatasetDescriptor {
    pub fn file_name(&self) -> String {
        format!("{}.csv", self.name)
    }
}

/// Provenance of the last completed download of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadMetadataEntry {
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub etag: Option<String>,
    pub size: u64,
    pub downloaded_at: String,
}

#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub dataset: DatasetDescriptor,
    pub url: String,
    pub output_path: PathBuf,
}

impl DownloadTask {
    /// Bytes are streamed here and only renamed onto `output_path` once complete.
    pub fn partial_path(&self) -> PathBuf {
        let mut name = self.output_path.as_os_str().to_owned();
        name.push(".part");
        PathBuf::from(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    Checking,
    Downloading,
    Completed,
    Skipped,
    Failed,
    Retrying,
}

impl DownloadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadStatus::Checking => "checking",
            DownloadStatus::Downloading => "downloading",
            DownloadStatus::Completed => "completed",
            DownloadStatus::Skipped => "skipped",
            DownloadStatus::Failed => "failed",
            DownloadStatus::Retrying => "retrying",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadProgress {
    pub dataset: String,
    pub status: DownloadStatus,
    pub progress: f64,
    pub downloaded: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadProgress {
    pub fn new(dataset: &str, status: DownloadStatus) -> Self {
        Self {
            dataset: dataset.to_string(),
            status,
            progress: 0.0,
            downloaded: 0,
            total: 0,
            error: None,
        }
    }
}

#[derive(Debug)]
pub struct SyncReport {
    pub task: DownloadTask,
    pub status: DownloadStatus,
    pub bytes_downloaded: u64,
    pub attempts: u32,
    pub duration: Duration,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct SyncSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub total_bytes_downloaded: u64,
    pub total_duration: Duration,
    pub reports: Vec<SyncReport>,
}

impl SyncSummary {
    pub fn from_reports(reports: Vec<SyncReport>, total_duration: Duration) -> Self {
        let count = |status| reports.iter().filter(|r| r.status == status).count();
        Self {
            completed: count(DownloadStatus::Completed),
            skipped: count(DownloadStatus::Skipped),
            failed: count(DownloadStatus::Failed),
            total_bytes_downloaded: reports.iter().map(|r| r.bytes_downloaded).sum(),
            total_duration,
            reports,
        }
    }

    pub fn report(&self, dataset: &str) -> Option<&SyncReport> {
        self.reports.iter().find(|r| r.task.dataset.name == dataset)
    }
}
