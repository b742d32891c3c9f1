mod common;

use assert_matches::assert_matches;
use common::{descriptor, drain, view_path, LAST_MODIFIED};
use rdw_dashboard::downloader::{SyncMode, Synchronizer};
use rdw_dashboard::metadata::MetadataStore;
use rdw_dashboard::progress::{NullSink, SyncEvent};
use rdw_dashboard::registry::Registry;
use rdw_dashboard::types::{DownloadMetadataEntry, DownloadStatus};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BODY: &str = "Kenteken,Merk\nAA01BB,TESLA\nAA02BB,VOLVO\n";

fn csv_response(etag: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("ETag", etag)
        .insert_header("Last-Modified", LAST_MODIFIED)
        .set_body_string(BODY)
}

fn head_response(etag: &str) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .insert_header("ETag", etag)
        .insert_header("Last-Modified", LAST_MODIFIED)
}

async fn seed_local_copy(sync: &Synchronizer, dir: &Path, name: &str, etag: &str) {
    std::fs::write(dir.join(format!("{}.csv", name)), BODY).unwrap();
    sync.metadata()
        .record(
            name,
            DownloadMetadataEntry {
                last_modified: Some(LAST_MODIFIED.to_string()),
                etag: Some(etag.to_string()),
                size: BODY.len() as u64,
                downloaded_at: "2024-10-01T08:00:00+00:00".to_string(),
            },
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn unchanged_remote_is_skipped_without_get() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let sync = common::synchronizer(dir.path(), &server.uri()).await;
    seed_local_copy(&sync, dir.path(), "alpha", "\"v1\"").await;

    Mock::given(method("HEAD"))
        .and(path(view_path("aaaa-0001")))
        .respond_with(head_response("\"v1\""))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(csv_response("\"v1\""))
        .expect(0)
        .mount(&server)
        .await;

    let report = sync
        .sync_dataset(&descriptor("aaaa-0001", "alpha", 1), &NullSink)
        .await;
    assert_eq!(report.status, DownloadStatus::Skipped);
    assert_eq!(report.attempts, 0);
    assert_eq!(report.bytes_downloaded, 0);
}

#[tokio::test]
async fn missing_file_is_fetched_even_with_stored_metadata() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let sync = common::synchronizer(dir.path(), &server.uri()).await;
    seed_local_copy(&sync, dir.path(), "alpha", "\"v1\"").await;
    std::fs::remove_file(dir.path().join("alpha.csv")).unwrap();

    Mock::given(method("HEAD"))
        .respond_with(head_response("\"v1\""))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(view_path("aaaa-0001")))
        .respond_with(csv_response("\"v1\""))
        .expect(1)
        .mount(&server)
        .await;

    let report = sync
        .sync_dataset(&descriptor("aaaa-0001", "alpha", 1), &NullSink)
        .await;
    assert_eq!(report.status, DownloadStatus::Completed);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("alpha.csv")).unwrap(),
        BODY
    );
}

#[tokio::test]
async fn skipped_and_fetched_datasets_are_tallied() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let sync = common::synchronizer(dir.path(), &server.uri()).await;
    seed_local_copy(&sync, dir.path(), "alpha", "\"a1\"").await;

    Mock::given(method("HEAD"))
        .and(path(view_path("aaaa-0001")))
        .respond_with(head_response("\"a1\""))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(view_path("aaaa-0001")))
        .respond_with(csv_response("\"a1\""))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(view_path("bbbb-0002")))
        .respond_with(csv_response("\"b1\""))
        .expect(1)
        .mount(&server)
        .await;

    let summary = sync
        .sync_all(
            &common::two_dataset_registry(),
            SyncMode::Parallel { workers: 1 },
            &NullSink,
        )
        .await;

    assert_eq!(
        (summary.completed, summary.skipped, summary.failed),
        (1, 1, 0)
    );
    assert_eq!(summary.report("alpha").unwrap().status, DownloadStatus::Skipped);
    assert_eq!(summary.report("beta").unwrap().status, DownloadStatus::Completed);

    let stored = sync.metadata().get("beta").await.unwrap();
    assert_eq!(stored.etag.as_deref(), Some("\"b1\""));
    assert_eq!(stored.last_modified.as_deref(), Some(LAST_MODIFIED));
    assert_eq!(stored.size, BODY.len() as u64);
    assert!(dir.path().join("sync_report.csv").exists());
}

#[tokio::test]
async fn second_pass_without_remote_changes_skips_everything() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    for id in ["aaaa-0001", "bbbb-0002"] {
        Mock::given(method("GET"))
            .and(path(view_path(id)))
            .respond_with(csv_response("\"same\""))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path(view_path(id)))
            .respond_with(head_response("\"same\""))
            .expect(1)
            .mount(&server)
            .await;
    }

    let registry = common::two_dataset_registry();
    let first = common::synchronizer(dir.path(), &server.uri())
        .await
        .sync_all(&registry, SyncMode::Parallel { workers: 2 }, &NullSink)
        .await;
    assert_eq!(first.completed, 2);

    // A fresh process reads the persisted metadata back from disk.
    let second = common::synchronizer(dir.path(), &server.uri())
        .await
        .sync_all(&registry, SyncMode::Sequential, &NullSink)
        .await;
    assert_eq!(
        (second.completed, second.skipped, second.failed),
        (0, 2, 0)
    );
}

#[tokio::test]
async fn one_redirect_hop_is_followed() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let sync = common::synchronizer(dir.path(), &server.uri()).await;

    Mock::given(method("GET"))
        .and(path(view_path("aaaa-0001")))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/files/alpha.csv"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/alpha.csv"))
        .respond_with(csv_response("\"final\""))
        .expect(1)
        .mount(&server)
        .await;

    let report = sync
        .sync_dataset(&descriptor("aaaa-0001", "alpha", 1), &NullSink)
        .await;
    assert_eq!(report.status, DownloadStatus::Completed);
    let stored = sync.metadata().get("alpha").await.unwrap();
    assert_eq!(stored.etag.as_deref(), Some("\"final\""));
}

#[tokio::test]
async fn redirect_chains_fail_without_retry() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let sync = common::synchronizer(dir.path(), &server.uri()).await;

    Mock::given(method("GET"))
        .and(path(view_path("aaaa-0001")))
        .respond_with(ResponseTemplate::new(302).insert_header("Location", "/hop1"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/hop1"))
        .respond_with(ResponseTemplate::new(301).insert_header("Location", "/hop2"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/hop2"))
        .respond_with(csv_response("\"x\""))
        .expect(0)
        .mount(&server)
        .await;

    let report = sync
        .sync_dataset(&descriptor("aaaa-0001", "alpha", 1), &NullSink)
        .await;
    assert_eq!(report.status, DownloadStatus::Failed);
    assert_eq!(report.attempts, 1);
    assert!(report.error.unwrap().contains("redirect"));
    assert!(!dir.path().join("alpha.csv").exists());
    assert_eq!(sync.metadata().get("alpha").await, None);
}

#[tokio::test]
async fn unexpected_status_is_not_retried() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let sync = common::synchronizer(dir.path(), &server.uri()).await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let report = sync
        .sync_dataset(&descriptor("aaaa-0001", "alpha", 1), &NullSink)
        .await;
    assert_eq!(report.status, DownloadStatus::Failed);
    assert_eq!(report.attempts, 1);
    assert!(!dir.path().join("alpha.csv").exists());
}

#[tokio::test]
async fn failed_probe_assumes_stale() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let sync = common::synchronizer(dir.path(), &server.uri()).await;
    seed_local_copy(&sync, dir.path(), "alpha", "\"v1\"").await;

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(csv_response("\"v1\""))
        .expect(1)
        .mount(&server)
        .await;

    let report = sync
        .sync_dataset(&descriptor("aaaa-0001", "alpha", 1), &NullSink)
        .await;
    assert_eq!(report.status, DownloadStatus::Completed);
}

#[tokio::test]
async fn probe_without_validators_assumes_stale() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let sync = common::synchronizer(dir.path(), &server.uri()).await;
    seed_local_copy(&sync, dir.path(), "alpha", "\"v1\"").await;

    Mock::given(method("HEAD"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(csv_response("\"v1\""))
        .expect(1)
        .mount(&server)
        .await;

    let report = sync
        .sync_dataset(&descriptor("aaaa-0001", "alpha", 1), &NullSink)
        .await;
    assert_eq!(report.status, DownloadStatus::Completed);
}

#[tokio::test]
async fn changed_etag_triggers_download() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let sync = common::synchronizer(dir.path(), &server.uri()).await;
    seed_local_copy(&sync, dir.path(), "alpha", "\"v1\"").await;

    Mock::given(method("HEAD"))
        .respond_with(head_response("\"v2\""))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(csv_response("\"v2\""))
        .expect(1)
        .mount(&server)
        .await;

    let report = sync
        .sync_dataset(&descriptor("aaaa-0001", "alpha", 1), &NullSink)
        .await;
    assert_eq!(report.status, DownloadStatus::Completed);
    assert_eq!(
        sync.metadata().get("alpha").await.unwrap().etag.as_deref(),
        Some("\"v2\"")
    );
}

#[tokio::test]
async fn force_skips_the_staleness_probe() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let metadata = MetadataStore::load(dir.path().join("download_metadata.json"))
        .await
        .unwrap();
    let mut options = common::options(dir.path(), &server.uri());
    options.force = true;
    let sync = Synchronizer::new(options, metadata).unwrap();
    seed_local_copy(&sync, dir.path(), "alpha", "\"v1\"").await;

    Mock::given(method("HEAD"))
        .respond_with(head_response("\"v1\""))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(csv_response("\"v1\""))
        .expect(1)
        .mount(&server)
        .await;

    let report = sync
        .sync_dataset(&descriptor("aaaa-0001", "alpha", 1), &NullSink)
        .await;
    assert_eq!(report.status, DownloadStatus::Completed);
}

#[tokio::test]
async fn events_are_ordered_per_dataset_and_complete_is_last() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let sync = common::synchronizer(dir.path(), &server.uri()).await;

    Mock::given(method("GET"))
        .and(path(view_path("aaaa-0001")))
        .respond_with(csv_response("\"a\""))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(view_path("bbbb-0002")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let summary = sync
        .sync_all(
            &common::two_dataset_registry(),
            SyncMode::Parallel { workers: 2 },
            &tx,
        )
        .await;
    assert_eq!((summary.completed, summary.failed), (1, 1));

    let events = drain(&mut rx);
    assert_eq!(events.first(), Some(&SyncEvent::Start));
    assert_eq!(
        events.last(),
        Some(&SyncEvent::Complete {
            completed: 1,
            skipped: 0,
            failed: 1
        })
    );

    for name in ["alpha", "beta"] {
        let positions: Vec<(usize, &SyncEvent)> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.dataset() == Some(name))
            .collect();
        assert_matches!(positions.first(), Some((_, SyncEvent::DatasetStart { .. })));
        assert_matches!(positions.last(), Some((_, SyncEvent::DatasetComplete { .. })));
        let completions = positions
            .iter()
            .filter(|(_, e)| matches!(e, SyncEvent::DatasetComplete { .. }))
            .count();
        assert_eq!(completions, 1);
    }

    let last_alpha_progress = events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::Progress(p) if p.dataset == "alpha" => Some(p),
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(last_alpha_progress.downloaded, BODY.len() as u64);
    assert_eq!(last_alpha_progress.total, BODY.len() as u64);
    assert_eq!(last_alpha_progress.progress, 100.0);

    assert_matches!(
        events.iter().find(|e| matches!(e, SyncEvent::DatasetComplete { dataset, .. } if dataset == "beta")),
        Some(SyncEvent::DatasetComplete { status: DownloadStatus::Failed, error: Some(_), .. })
    );
}

#[tokio::test]
async fn sequential_mode_follows_registry_order() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let sync = common::synchronizer(dir.path(), &server.uri()).await;

    Mock::given(method("GET"))
        .respond_with(csv_response("\"a\""))
        .expect(3)
        .mount(&server)
        .await;

    let registry = Registry::new(vec![
        descriptor("cccc-0003", "gamma", 3),
        descriptor("aaaa-0001", "alpha", 1),
        descriptor("bbbb-0002", "beta", 2),
    ]);
    let summary = sync
        .sync_all(&registry, SyncMode::Sequential, &NullSink)
        .await;
    let order: Vec<_> = summary
        .reports
        .iter()
        .map(|r| r.task.dataset.name.as_str())
        .collect();
    assert_eq!(order, vec!["alpha", "beta", "gamma"]);
}

#[tokio::test]
async fn slow_dataset_does_not_hold_back_the_pool() {
    let server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let sync = common::synchronizer(dir.path(), &server.uri()).await;

    Mock::given(method("GET"))
        .and(path(view_path("aaaa-0001")))
        .respond_with(csv_response("\"a\"").set_delay(Duration::from_millis(500)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(csv_response("\"b\""))
        .expect(2)
        .mount(&server)
        .await;

    let registry = Registry::new(vec![
        descriptor("aaaa-0001", "alpha", 1),
        descriptor("bbbb-0002", "beta", 2),
        descriptor("cccc-0003", "gamma", 3),
    ]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let summary = sync
        .sync_all(&registry, SyncMode::Parallel { workers: 2 }, &tx)
        .await;
    assert_eq!(summary.completed, 3);

    let events = drain(&mut rx);
    let gamma_start = events
        .iter()
        .position(|e| matches!(e, SyncEvent::DatasetStart { dataset } if dataset == "gamma"))
        .unwrap();
    let alpha_complete = events
        .iter()
        .position(|e| matches!(e, SyncEvent::DatasetComplete { dataset, .. } if dataset == "alpha"))
        .unwrap();
    assert!(
        gamma_start < alpha_complete,
        "gamma waited for alpha: start at {}, alpha done at {}",
        gamma_start,
        alpha_complete
    );
}
