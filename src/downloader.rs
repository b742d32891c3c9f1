use crate::error::SyncError;
use crate::metadata::MetadataStore;
use crate::progress::{EventSink, SyncEvent};
use crate::registry::{self, Registry};
use crate::types::{
    DatasetDescriptor, DownloadMetadataEntry, DownloadProgress, DownloadStatus, DownloadTask,
    SyncReport, SyncSummary,
};
use chrono::{DateTime, FixedOffset, Utc};
use futures::StreamExt;
use log::{debug, error, info, warn};
use reqwest::header::{HeaderMap, HeaderName, CONTENT_LENGTH, ETAG, LAST_MODIFIED, LOCATION};
use reqwest::{Method, Response, StatusCode, Url};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::sleep;

/// Progress granularity when the server does not announce a length.
const UNKNOWN_LENGTH_STEP: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub data_dir: PathBuf,
    pub base_url: String,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub progress_step_percent: f64,
    pub connect_timeout: Duration,
    /// Skip the staleness probe and always fetch.
    pub force: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            base_url: "https://opendata.rdw.nl".to_string(),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(2),
            progress_step_percent: 5.0,
            connect_timeout: Duration::from_secs(30),
            force: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Sequential,
    Parallel { workers: usize },
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Parallel { workers: 3 }
    }
}

/// `Last-Modified` / `ETag` pair as served by the remote source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteValidators {
    pub last_modified: Option<String>,
    pub etag: Option<String>,
}

impl RemoteValidators {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            last_modified: header(LAST_MODIFIED),
            etag: header(ETAG),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last_modified.is_none() && self.etag.is_none()
    }

    /// True when the stored download is still current: the ETag matches
    /// exactly and the remote timestamp is not newer than the stored one.
    pub fn matches(&self, stored: &DownloadMetadataEntry) -> bool {
        self.etag == stored.etag
            && !is_newer(self.last_modified.as_deref(), stored.last_modified.as_deref())
    }
}

fn is_newer(remote: Option<&str>, stored: Option<&str>) -> bool {
    match (remote, stored) {
        (None, None) => false,
        (Some(remote), Some(stored)) => match (parse_http_date(remote), parse_http_date(stored)) {
            (Some(remote), Some(stored)) => remote > stored,
            _ => remote != stored,
        },
        _ => true,
    }
}

fn parse_http_date(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc2822(value).ok()
}

struct FetchedFile {
    bytes: u64,
    validators: RemoteValidators,
}

enum Outcome {
    Skipped,
    Completed(FetchedFile),
}

/// Emits a progress event each time the download crosses another
/// `step` percent, or another 8 MiB when the length is unknown.
/// `finish` yields the closing 100% unless it was already reported.
struct ProgressThrottle {
    step: f64,
    last_mark: u64,
    reported_complete: bool,
}

impl ProgressThrottle {
    fn new(step: f64) -> Self {
        let step = if step.is_finite() && step > 0.0 { step } else { 1.0 };
        Self {
            step,
            last_mark: 0,
            reported_complete: false,
        }
    }

    fn advance(&mut self, downloaded: u64, total: u64) -> Option<f64> {
        let (mark, percent) = if total > 0 {
            let percent = (downloaded as f64 / total as f64 * 100.0).min(100.0);
            ((percent / self.step).floor() as u64, percent)
        } else {
            (downloaded / UNKNOWN_LENGTH_STEP, 0.0)
        };
        if mark > self.last_mark {
            self.last_mark = mark;
            self.reported_complete = percent >= 100.0;
            Some(percent)
        } else {
            None
        }
    }

    fn finish(&mut self) -> Option<f64> {
        if self.reported_complete {
            return None;
        }
        self.reported_complete = true;
        Some(100.0)
    }
}

/// Brings local copies of the registry datasets up to date.
///
/// At most one sync of a given dataset runs at a time per synchronizer; a
/// second caller waits for the first and then re-checks staleness.
pub struct Synchronizer {
    client: reqwest::Client,
    options: SyncOptions,
    metadata: MetadataStore,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Synchronizer {
    pub fn new(options: SyncOptions, metadata: MetadataStore) -> Result<Self, SyncError> {
        // Redirects are followed by hand so the one-hop limit is enforced here.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(options.connect_timeout)
            .build()?;
        Ok(Self {
            client,
            options,
            metadata,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub async fn sync_all(
        &self,
        registry: &Registry,
        mode: SyncMode,
        sink: &dyn EventSink,
    ) -> SyncSummary {
        sink.emit(SyncEvent::Start);
        let start_time = Instant::now();
        info!(
            "Synchronizing {} datasets into {} ({:?})",
            registry.len(),
            self.options.data_dir.display(),
            mode
        );

        if let Err(e) = tokio::fs::create_dir_all(&self.options.data_dir).await {
            error!(
                "Failed to create data directory {}: {}",
                self.options.data_dir.display(),
                e
            );
            sink.emit(SyncEvent::Error {
                error: format!("cannot create data directory: {}", e),
            });
        }

        let reports = match mode {
            SyncMode::Sequential => {
                let mut reports = Vec::with_capacity(registry.len());
                for dataset in registry.datasets() {
                    reports.push(self.sync_dataset(dataset, sink).await);
                }
                reports
            }
            SyncMode::Parallel { workers } => {
                futures::stream::iter(registry.datasets().to_vec())
                    .map(|dataset| async move { self.sync_dataset(&dataset, sink).await })
                    .buffer_unordered(workers.max(1))
                    .collect::<Vec<_>>()
                    .await
            }
        };

        let summary = SyncSummary::from_reports(reports, start_time.elapsed());
        info!(
            "Synchronization finished: {} completed, {} skipped, {} failed",
            summary.completed, summary.skipped, summary.failed
        );

        if let Err(e) = self.write_report_csv(&summary).await {
            error!("Failed to write sync report CSV: {}", e);
        }

        sink.emit(SyncEvent::Complete {
            completed: summary.completed,
            skipped: summary.skipped,
            failed: summary.failed,
        });
        summary
    }

    /// Synchronizes one dataset. Never fails: errors end up in the report.
    pub async fn sync_dataset(
        &self,
        dataset: &DatasetDescriptor,
        sink: &dyn EventSink,
    ) -> SyncReport {
        let task = self.create_task(dataset);
        let start_time = Instant::now();
        let name = task.dataset.name.clone();
        sink.emit(SyncEvent::DatasetStart {
            dataset: name.clone(),
        });

        let mut attempts = 0;
        let result = {
            let _guard = self.dataset_guard(&name).await;
            self.run_task(&task, sink, &mut attempts).await
        };

        let (status, bytes_downloaded, error) = match result {
            Ok(Outcome::Skipped) => {
                info!("{} is up to date, skipping download", name);
                (DownloadStatus::Skipped, 0, None)
            }
            Ok(Outcome::Completed(fetched)) => {
                info!("Downloaded {} ({} bytes)", name, fetched.bytes);
                (DownloadStatus::Completed, fetched.bytes, None)
            }
            Err(e) => {
                let error_msg = e.to_string();
                error!("Download failed for {}: {}", task.url, error_msg);
                (DownloadStatus::Failed, 0, Some(error_msg))
            }
        };

        sink.emit(SyncEvent::DatasetComplete {
            dataset: name,
            status,
            error: error.clone(),
        });

        SyncReport {
            task,
            status,
            bytes_downloaded,
            attempts,
            duration: start_time.elapsed(),
            error,
        }
    }

    async fn dataset_guard(&self, dataset: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .in_flight
            .lock()
            .await
            .entry(dataset.to_string())
            .or_default()
            .clone();
        match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                info!("{} is already being synchronized, waiting", dataset);
                lock.lock_owned().await
            }
        }
    }

    async fn run_task(
        &self,
        task: &DownloadTask,
        sink: &dyn EventSink,
        attempts: &mut u32,
    ) -> Result<Outcome, SyncError> {
        let name = &task.dataset.name;
        if !self.options.force && tokio::fs::try_exists(&task.output_path).await? {
            sink.emit(SyncEvent::Progress(DownloadProgress::new(
                name,
                DownloadStatus::Checking,
            )));
            if self.is_up_to_date(task).await {
                return Ok(Outcome::Skipped);
            }
        }

        let fetched = self.fetch_with_retry(task, sink, attempts).await?;

        let entry = DownloadMetadataEntry {
            last_modified: fetched.validators.last_modified.clone(),
            etag: fetched.validators.etag.clone(),
            size: fetched.bytes,
            downloaded_at: Utc::now().to_rfc3339(),
        };
        self.metadata.record(name, entry).await?;
        Ok(Outcome::Completed(fetched))
    }

    /// A failed probe counts as stale; the dataset is downloaded again.
    async fn is_up_to_date(&self, task: &DownloadTask) -> bool {
        let Some(stored) = self.metadata.get(&task.dataset.name).await else {
            debug!(
                "No stored metadata for {}, treating local file as stale",
                task.dataset.name
            );
            return false;
        };

        match self.probe(&task.url).await {
            Ok(remote) => {
                let fresh = remote.matches(&stored);
                debug!(
                    "{}: remote {:?} vs stored etag={:?} last_modified={:?} -> fresh={}",
                    task.dataset.name, remote, stored.etag, stored.last_modified, fresh
                );
                fresh
            }
            Err(e) => {
                warn!(
                    "Staleness check failed for {}: {}; assuming stale",
                    task.dataset.name, e
                );
                false
            }
        }
    }

    /// Metadata-only request for the dataset's validators.
    pub async fn probe(&self, url: &str) -> Result<RemoteValidators, SyncError> {
        let resp = self.send(Method::HEAD, url).await?;
        let validators = RemoteValidators::from_headers(resp.headers());
        if validators.is_empty() {
            return Err(SyncError::Protocol(format!(
                "no Last-Modified or ETag header for {}",
                url
            )));
        }
        Ok(validators)
    }

    async fn fetch_with_retry(
        &self,
        task: &DownloadTask,
        sink: &dyn EventSink,
        attempts: &mut u32,
    ) -> Result<FetchedFile, SyncError> {
        let max_attempts = self.options.max_attempts.max(1);
        loop {
            *attempts += 1;
            let result = self.fetch(task, sink).await;
            let e = match result {
                Ok(fetched) => return Ok(fetched),
                Err(e) => e,
            };

            remove_partial(&task.partial_path()).await;

            if !e.is_retryable() || *attempts >= max_attempts {
                return Err(e);
            }

            warn!(
                "Attempt {}/{} for {} failed: {}; retrying in {:?}",
                attempts, max_attempts, task.dataset.name, e, self.options.retry_backoff
            );
            sink.emit(SyncEvent::Progress(DownloadProgress {
                error: Some(e.to_string()),
                ..DownloadProgress::new(&task.dataset.name, DownloadStatus::Retrying)
            }));
            sleep(self.options.retry_backoff).await;
        }
    }

    async fn fetch(&self, task: &DownloadTask, sink: &dyn EventSink) -> Result<FetchedFile, SyncError> {
        info!("Starting download: {}", task.url);
        let resp = self.send(Method::GET, &task.url).await?;
        let validators = RemoteValidators::from_headers(resp.headers());
        let total = content_length(&resp);

        let partial = task.partial_path();
        let mut file = File::create(&partial).await?;
        let mut stream = resp.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut throttle = ProgressThrottle::new(self.options.progress_step_percent);

        sink.emit(SyncEvent::Progress(DownloadProgress {
            total,
            ..DownloadProgress::new(&task.dataset.name, DownloadStatus::Downloading)
        }));

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if let Some(percent) = throttle.advance(downloaded, total) {
                sink.emit(SyncEvent::Progress(DownloadProgress {
                    progress: percent,
                    downloaded,
                    total,
                    ..DownloadProgress::new(&task.dataset.name, DownloadStatus::Downloading)
                }));
            }
        }

        if total > 0 && downloaded != total {
            return Err(SyncError::Truncated {
                expected: total,
                received: downloaded,
            });
        }
        if let Some(percent) = throttle.finish() {
            sink.emit(SyncEvent::Progress(DownloadProgress {
                progress: percent,
                downloaded,
                total,
                ..DownloadProgress::new(&task.dataset.name, DownloadStatus::Downloading)
            }));
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&partial, &task.output_path).await?;

        Ok(FetchedFile {
            bytes: downloaded,
            validators,
        })
    }

    /// Sends a request, following at most one 301/302 hop. Any final status
    /// other than 200 is a protocol failure.
    async fn send(&self, method: Method, url: &str) -> Result<Response, SyncError> {
        let resp = self.client.request(method.clone(), url).send().await?;
        let resp = if is_redirect(resp.status()) {
            let target = redirect_target(&resp)?;
            debug!("{} redirected to {}", url, target);
            let next = self.client.request(method, target).send().await?;
            if is_redirect(next.status()) {
                return Err(SyncError::Protocol(format!(
                    "redirect chain longer than one hop for {}",
                    url
                )));
            }
            next
        } else {
            resp
        };

        if resp.status() != StatusCode::OK {
            return Err(SyncError::Protocol(format!(
                "HTTP error: {} for URL: {}",
                resp.status(),
                resp.url()
            )));
        }
        Ok(resp)
    }

    fn create_task(&self, dataset: &DatasetDescriptor) -> DownloadTask {
        DownloadTask {
            dataset: dataset.clone(),
            url: registry::dataset_url(&self.options.base_url, dataset),
            output_path: registry::dataset_path(&self.options.data_dir, dataset),
        }
    }

    async fn write_report_csv(&self, summary: &SyncSummary) -> Result<(), SyncError> {
        tokio::fs::create_dir_all(&self.options.data_dir).await?;

        let report_path = self.options.data_dir.join("sync_report.csv");
        let mut wtr = csv::WriterBuilder::new().from_path(report_path)?;

        wtr.write_record([
            "Dataset",
            "Status",
            "Size (MB)",
            "Duration (s)",
            "Attempts",
            "URL",
            "Error",
        ])?;

        for report in &summary.reports {
            wtr.write_record(&[
                report.task.dataset.name.clone(),
                report.status.as_str().to_string(),
                format!("{:.2}", report.bytes_downloaded as f64 / 1_048_576.0),
                format!("{:.2}", report.duration.as_secs_f64()),
                report.attempts.to_string(),
                report.task.url.clone(),
                report.error.clone().unwrap_or_default(),
            ])?;
        }

        wtr.flush()?;
        Ok(())
    }
}

fn is_redirect(status: StatusCode) -> bool {
    status == StatusCode::MOVED_PERMANENTLY || status == StatusCode::FOUND
}

fn redirect_target(resp: &Response) -> Result<Url, SyncError> {
    let location = resp
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            SyncError::Protocol(format!("redirect from {} without Location", resp.url()))
        })?;
    resp.url().join(location).map_err(|e| {
        SyncError::Protocol(format!("invalid redirect location {:?}: {}", location, e))
    })
}

fn content_length(resp: &Response) -> u64 {
    resp.content_length()
        .or_else(|| {
            resp.headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
        })
        .unwrap_or(0)
}

async fn remove_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed partial download {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial download {}: {}", path.display(), e),
    }
}
