use crate::downloader::{SyncMode, Synchronizer};
use crate::registry::Registry;
use crate::types::{DownloadProgress, DownloadStatus, SyncSummary};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{JoinError, JoinHandle};

const SESSION_CHANNEL_CAPACITY: usize = 1024;

/// Events emitted during one synchronization pass.
///
/// Per dataset: `DatasetStart`, then any number of `Progress`, then exactly
/// one `DatasetComplete`. `Complete` is always the last event of a pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Start,
    DatasetStart {
        dataset: String,
    },
    Progress(DownloadProgress),
    DatasetComplete {
        dataset: String,
        status: DownloadStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Complete {
        completed: usize,
        skipped: usize,
        failed: usize,
    },
    Error {
        error: String,
    },
}

impl SyncEvent {
    pub fn dataset(&self) -> Option<&str> {
        match self {
            SyncEvent::DatasetStart { dataset } | SyncEvent::DatasetComplete { dataset, .. } => {
                Some(dataset.as_str())
            }
            SyncEvent::Progress(progress) => Some(progress.dataset.as_str()),
            _ => None,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SyncEvent);
}

impl EventSink for broadcast::Sender<SyncEvent> {
    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine; the pass runs regardless.
        let _ = self.send(event);
    }
}

impl EventSink for mpsc::UnboundedSender<SyncEvent> {
    fn emit(&self, event: SyncEvent) {
        let _ = self.send(event);
    }
}

pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: SyncEvent) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync-{}", self.0)
    }
}

struct Session {
    events: broadcast::Sender<SyncEvent>,
    task: JoinHandle<SyncSummary>,
}

/// Returned by [`SyncSessions::start`]; the receiver is subscribed before
/// the pass begins, so it observes the `Start` event.
pub struct SyncHandle {
    pub id: SessionId,
    pub events: broadcast::Receiver<SyncEvent>,
}

/// Running synchronization passes keyed by session id.
#[derive(Default)]
pub struct SyncSessions {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, Session>>,
}

impl SyncSessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start(
        &self,
        synchronizer: Arc<Synchronizer>,
        registry: Registry,
        mode: SyncMode,
    ) -> SyncHandle {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = broadcast::channel(SESSION_CHANNEL_CAPACITY);
        let sink = tx.clone();
        let task = tokio::spawn(async move {
            synchronizer.sync_all(&registry, mode, &sink).await
        });
        debug!("Started synchronization session {}", id);
        self.sessions
            .lock()
            .await
            .insert(id, Session { events: tx, task });
        SyncHandle { id, events: rx }
    }

    pub async fn subscribe(&self, id: SessionId) -> Option<broadcast::Receiver<SyncEvent>> {
        self.sessions
            .lock()
            .await
            .get(&id)
            .map(|s| s.events.subscribe())
    }

    pub async fn is_running(&self, id: SessionId) -> bool {
        self.sessions
            .lock()
            .await
            .get(&id)
            .map(|s| !s.task.is_finished())
            .unwrap_or(false)
    }

    /// Abandons a pass. Datasets in flight keep only their `.part` files,
    /// which the next pass overwrites.
    pub async fn cancel(&self, id: SessionId) -> bool {
        match self.sessions.lock().await.remove(&id) {
            Some(session) => {
                warn!("Cancelling synchronization session {}", id);
                session.task.abort();
                true
            }
            None => false,
        }
    }

    /// Waits for a pass to finish and forgets the session.
    pub async fn wait(&self, id: SessionId) -> Option<Result<SyncSummary, JoinError>> {
        let session = self.sessions.lock().await.remove(&id)?;
        Some(session.task.await)
    }
}

/// Renders synchronization events as one progress bar per dataset.
pub struct ConsoleReporter {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
        }
    }

    /// Drains `events` until the pass completes or the channel closes.
    pub async fn run(mut self, mut events: broadcast::Receiver<SyncEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let done = matches!(event, SyncEvent::Complete { .. });
                    self.handle(&event);
                    if done {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Console reporter skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub fn handle(&mut self, event: &SyncEvent) {
        match event {
            SyncEvent::DatasetStart { dataset } => {
                let pb = self.multi.add(create_progress_bar(dataset));
                self.bars.insert(dataset.clone(), pb);
            }
            SyncEvent::Progress(progress) => {
                if let Some(pb) = self.bars.get(&progress.dataset) {
                    if progress.total > 0 {
                        pb.set_length(progress.total);
                    }
                    pb.set_position(progress.downloaded);
                    pb.set_message(format!("{} ({})", progress.dataset, progress.status.as_str()));
                }
            }
            SyncEvent::DatasetComplete {
                dataset,
                status,
                error,
            } => {
                if let Some(pb) = self.bars.remove(dataset) {
                    match error {
                        Some(e) => pb.abandon_with_message(format!("{}: failed ({})", dataset, e)),
                        None => pb.finish_with_message(format!("{}: {}", dataset, status.as_str())),
                    }
                }
            }
            SyncEvent::Error { error } => {
                let _ = self.multi.println(format!("error: {}", error));
            }
            SyncEvent::Start | SyncEvent::Complete { .. } => {}
        }
    }
}

fn create_progress_bar(dataset: &str) -> ProgressBar {
    let pb = ProgressBar::new(0);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec})")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_message(dataset.to_string());
    pb
}
