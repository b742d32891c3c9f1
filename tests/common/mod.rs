#![allow(dead_code)]

use rdw_dashboard::downloader::{SyncOptions, Synchronizer};
use rdw_dashboard::metadata::MetadataStore;
use rdw_dashboard::progress::SyncEvent;
use rdw_dashboard::registry::Registry;
use rdw_dashboard::types::DatasetDescriptor;
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;

pub const LAST_MODIFIED: &str = "Tue, 01 Oct 2024 06:00:00 GMT";

pub fn descriptor(id: &str, name: &str, priority: u32) -> DatasetDescriptor {
    DatasetDescriptor {
        id: id.to_string(),
        name: name.to_string(),
        description: format!("{} fixture", name),
        estimated_size: "1 KB".to_string(),
        priority,
    }
}

pub fn two_dataset_registry() -> Registry {
    Registry::new(vec![
        descriptor("aaaa-0001", "alpha", 1),
        descriptor("bbbb-0002", "beta", 2),
    ])
}

pub fn view_path(id: &str) -> String {
    format!("/api/views/{}/rows.csv", id)
}

pub fn options(data_dir: &Path, base_url: &str) -> SyncOptions {
    SyncOptions {
        data_dir: data_dir.to_path_buf(),
        base_url: base_url.to_string(),
        max_attempts: 3,
        retry_backoff: Duration::from_millis(0),
        progress_step_percent: 25.0,
        connect_timeout: Duration::from_secs(5),
        force: false,
    }
}

pub async fn synchronizer(data_dir: &Path, base_url: &str) -> Synchronizer {
    let metadata = MetadataStore::load(data_dir.join("download_metadata.json"))
        .await
        .unwrap();
    Synchronizer::new(options(data_dir, base_url), metadata).unwrap()
}

pub fn drain(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
