//! Integration tests for the ouiwatch server.
//!
//! Each test spins up a REAL axum server on a random port that plays the role
//! of the remote reference source, plus (for API tests) the real ouiwatch
//! router on another port, and talks to both over HTTP via `reqwest`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use axum::{http::StatusCode, routing::get, Router};
use flate2::{write::GzEncoder, Compression};
use ouiwatch_server::{
    api,
    coordinator::Coordinator,
    oui::{OuiDatabase, OuiMatch},
    refresh::{RefreshEvent, RefreshScheduler, RefreshSettings, Stage},
};
use serde_json::Value;

const MANUF_V1: &str = "\
# Test reference file
00:00:0C\tCisco\tCisco Systems, Inc
00:00:0C/16\tXerox\tEarly cards
00:1B:C5\tIEEERegi\tIEEE Registration Authority
00:1B:C5:00:00:00/36\tConverging\tConverging Systems Inc.
AC-DE-48 Private
";

const MANUF_V2: &str = "\
52:54:00\tQEMU\tQEMU virtual NIC
";

fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

/// A fake reference source whose response can be swapped mid-test.
struct Source {
    url: String,
    hits: Arc<AtomicUsize>,
    response: Arc<Mutex<(StatusCode, Vec<u8>)>>,
}

impl Source {
    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn respond_with(&self, status: StatusCode, body: Vec<u8>) {
        *self.response.lock().unwrap() = (status, body);
    }
}

/// Spawn a reference source serving `/manuf.gz` on a random port.
async fn spawn_source(status: StatusCode, body: Vec<u8>) -> Source {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind random port");
    let addr = listener.local_addr().expect("failed to get local address");

    let hits = Arc::new(AtomicUsize::new(0));
    let response = Arc::new(Mutex::new((status, body)));

    let handler = {
        let hits = hits.clone();
        let response = response.clone();
        move || {
            let hits = hits.clone();
            let response = response.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let (status, body) = response.lock().unwrap().clone();
                (status, body)
            }
        }
    };
    let app = Router::new().route("/manuf.gz", get(handler));

    tokio::spawn(async move {
        axum::serve(listener, app)
            .await
            .expect("source server error");
    });

    Source {
        url: format!("http://{addr}/manuf.gz"),
        hits,
        response,
    }
}

fn settings(destination: PathBuf, url: &str, schedule: &str, propagate: bool) -> RefreshSettings {
    RefreshSettings {
        destination,
        source_url: url.to_string(),
        schedule: schedule.parse().expect("valid schedule"),
        propagate_init_errors: propagate,
        timeout: Duration::from_secs(5),
    }
}

fn age_file(path: &Path, by: Duration) {
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() - by)
        .unwrap();
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<RefreshEvent>) -> Vec<RefreshEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn failed_stages(events: &[RefreshEvent]) -> Vec<Stage> {
    events
        .iter()
        .filter_map(|e| match e {
            RefreshEvent::Failed { stage, .. } => Some(*stage),
            RefreshEvent::Updated { .. } => None,
        })
        .collect()
}

// ── Scheduler ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_missing_destination_refreshes_once_then_arms_timer() {
    let source = spawn_source(StatusCode::OK, gzip(MANUF_V1)).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("data/manuf.gz");

    let scheduler =
        RefreshScheduler::new(settings(dest.clone(), &source.url, "@yearly", false)).unwrap();
    let mut events = scheduler.subscribe();

    scheduler.initialize().await.expect("initialize");

    assert_eq!(source.hits(), 1, "exactly one refresh attempt");
    assert_eq!(std::fs::read(&dest).unwrap(), gzip(MANUF_V1));
    assert!(scheduler.is_armed().await);

    match drain(&mut events).as_slice() {
        [RefreshEvent::Updated { path, url, .. }] => {
            assert_eq!(path, &dest);
            assert_eq!(url, &source.url);
        }
        other => panic!("unexpected events: {other:?}"),
    }
}

#[tokio::test]
async fn test_fresh_destination_is_not_downloaded() {
    let source = spawn_source(StatusCode::OK, gzip(MANUF_V2)).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("manuf.gz");
    std::fs::write(&dest, gzip(MANUF_V1)).unwrap();

    let scheduler =
        RefreshScheduler::new(settings(dest.clone(), &source.url, "@yearly", false)).unwrap();
    scheduler.initialize().await.expect("initialize");

    assert_eq!(source.hits(), 0);
    assert_eq!(std::fs::read(&dest).unwrap(), gzip(MANUF_V1));
    assert!(scheduler.is_armed().await);
}

#[tokio::test]
async fn test_missed_trigger_makes_destination_stale() {
    let source = spawn_source(StatusCode::OK, gzip(MANUF_V2)).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("manuf.gz");
    std::fs::write(&dest, gzip(MANUF_V1)).unwrap();
    age_file(&dest, Duration::from_secs(3 * 24 * 3600));

    let scheduler =
        RefreshScheduler::new(settings(dest.clone(), &source.url, "@daily", false)).unwrap();
    scheduler.initialize().await.expect("initialize");

    assert_eq!(source.hits(), 1);
    assert_eq!(std::fs::read(&dest).unwrap(), gzip(MANUF_V2));
}

#[tokio::test]
async fn test_download_failure_keeps_previous_file() {
    let source = spawn_source(StatusCode::INTERNAL_SERVER_ERROR, b"oops".to_vec()).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("manuf.gz");
    std::fs::write(&dest, gzip(MANUF_V1)).unwrap();

    let scheduler =
        RefreshScheduler::new(settings(dest.clone(), &source.url, "@yearly", false)).unwrap();
    let mut events = scheduler.subscribe();

    let err = scheduler.refresh_now().await.unwrap_err();
    assert_eq!(err.stage(), Stage::Download);
    assert!(err.to_string().contains("500"));

    assert_eq!(std::fs::read(&dest).unwrap(), gzip(MANUF_V1));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    assert_eq!(failed_stages(&drain(&mut events)), vec![Stage::Download]);
}

#[tokio::test]
async fn test_propagating_mode_raises_and_does_not_arm() {
    let source = spawn_source(StatusCode::NOT_FOUND, Vec::new()).await;
    let dir = tempfile::tempdir().unwrap();

    let scheduler = RefreshScheduler::new(settings(
        dir.path().join("manuf.gz"),
        &source.url,
        "@yearly",
        true,
    ))
    .unwrap();

    let err = scheduler.initialize().await.unwrap_err();
    assert_eq!(err.stage(), Stage::Download);
    assert_eq!(source.hits(), 1);
    assert!(!scheduler.is_armed().await);
}

#[tokio::test]
async fn test_notifying_mode_continues_and_arms() {
    let source = spawn_source(StatusCode::NOT_FOUND, Vec::new()).await;
    let dir = tempfile::tempdir().unwrap();

    let scheduler = RefreshScheduler::new(settings(
        dir.path().join("manuf.gz"),
        &source.url,
        "@yearly",
        false,
    ))
    .unwrap();
    let mut events = scheduler.subscribe();

    scheduler.initialize().await.expect("errors are only notified");
    assert!(scheduler.is_armed().await);
    assert_eq!(failed_stages(&drain(&mut events)), vec![Stage::Download]);
}

#[tokio::test]
async fn test_write_failure_reports_write_stage() {
    let source = spawn_source(StatusCode::OK, gzip(MANUF_V1)).await;
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"").unwrap();

    let scheduler = RefreshScheduler::new(settings(
        blocker.join("manuf.gz"),
        &source.url,
        "@yearly",
        false,
    ))
    .unwrap();

    let err = scheduler.refresh_now().await.unwrap_err();
    assert_eq!(err.stage(), Stage::Write);
    assert_eq!(source.hits(), 1);
}

#[tokio::test]
async fn test_staleness_check_failure() {
    let source = spawn_source(StatusCode::OK, gzip(MANUF_V1)).await;
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("not-a-dir");
    std::fs::write(&blocker, b"").unwrap();
    let dest = blocker.join("manuf.gz");

    // Propagating: the init error is returned before anything is fetched.
    let strict =
        RefreshScheduler::new(settings(dest.clone(), &source.url, "@yearly", true)).unwrap();
    let err = strict.initialize().await.unwrap_err();
    assert_eq!(err.stage(), Stage::Init);
    assert_eq!(source.hits(), 0);

    // Notifying: treated as stale, so a refresh is still attempted.
    let lenient = RefreshScheduler::new(settings(dest, &source.url, "@yearly", false)).unwrap();
    let mut events = lenient.subscribe();
    lenient.initialize().await.expect("errors are only notified");
    assert_eq!(source.hits(), 1);
    assert_eq!(
        failed_stages(&drain(&mut events)),
        vec![Stage::Init, Stage::Write]
    );
    assert!(lenient.is_armed().await);
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for_event(
    events: &mut tokio::sync::broadcast::Receiver<RefreshEvent>,
    within: Duration,
    pred: impl Fn(&RefreshEvent) -> bool,
) -> RefreshEvent {
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    panic!("event channel closed")
                }
            }
        }
    })
    .await
    .expect("timed out waiting for refresh event")
}

/// Runs against the real clock: each phase waits for the next minute boundary.
#[tokio::test]
async fn test_recurring_timer_refreshes_and_survives_failures() {
    let source = spawn_source(StatusCode::OK, gzip(MANUF_V1)).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("manuf.gz");

    let scheduler =
        RefreshScheduler::new(settings(dest.clone(), &source.url, "* * * * *", false)).unwrap();
    let mut events = scheduler.subscribe();
    scheduler.arm_timer().await;
    assert_eq!(source.hits(), 0);

    let minute = Duration::from_secs(70);
    wait_for_event(&mut events, minute, |e| {
        matches!(e, RefreshEvent::Updated { .. })
    })
    .await;
    assert!(source.hits() >= 1);
    assert_eq!(std::fs::read(&dest).unwrap(), gzip(MANUF_V1));

    source.respond_with(StatusCode::INTERNAL_SERVER_ERROR, Vec::new());
    let failed = wait_for_event(&mut events, minute, |e| {
        matches!(e, RefreshEvent::Failed { .. })
    })
    .await;
    assert_eq!(failed_stages(&[failed]), vec![Stage::Download]);
    assert!(scheduler.is_armed().await);
    assert_eq!(std::fs::read(&dest).unwrap(), gzip(MANUF_V1));

    scheduler.shutdown().await;
}

#[tokio::test]
async fn test_refresh_during_startup_is_not_lost() {
    let source = spawn_source(StatusCode::OK, gzip(MANUF_V2)).await;
    let dir = tempfile::tempdir().unwrap();
    let dest = dir.path().join("manuf.gz");
    // Fresh under @yearly, so startup does not download.
    std::fs::write(&dest, gzip(MANUF_V1)).unwrap();

    let scheduler = RefreshScheduler::new(settings(dest.clone(), &source.url, "@yearly", false))
        .expect("scheduler");
    let coordinator = Coordinator::new(scheduler, Arc::new(OuiDatabase::new(dest)));

    let (started, refreshed) = tokio::join!(coordinator.start(), coordinator.refresh());
    started.expect("start");
    refreshed.expect("refresh");

    let mut swapped = false;
    for _ in 0..50 {
        if coordinator.lookup("52:54:00:12:34:56").is_some() {
            swapped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(swapped, "refreshed data was never served");

    // Nothing may swap the older file back in afterwards.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(coordinator.lookup("52:54:00:12:34:56").is_some());
    assert!(coordinator.lookup("00:00:0C:11:22:33").is_none());
}

// ── Coordinator + HTTP API ──────────────────────────────────────────

/// Spawn the ouiwatch API on a random port. Returns the base URL.
async fn spawn_api(coordinator: Arc<Coordinator>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind random port");
    let addr = listener.local_addr().expect("failed to get local address");

    let app = api::router(api::AppState::new(coordinator));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server error");
    });

    format!("http://{addr}")
}

async fn started_coordinator(source: &Source, dest: PathBuf) -> Arc<Coordinator> {
    let scheduler = RefreshScheduler::new(settings(dest.clone(), &source.url, "@yearly", false))
        .expect("scheduler");
    let coordinator = Coordinator::new(scheduler, Arc::new(OuiDatabase::new(dest)));
    coordinator.start().await.expect("start");
    coordinator
}

#[tokio::test]
async fn test_coordinator_start_loads_index() {
    let source = spawn_source(StatusCode::OK, gzip(MANUF_V1)).await;
    let dir = tempfile::tempdir().unwrap();
    let coordinator = started_coordinator(&source, dir.path().join("manuf.gz")).await;

    assert_eq!(
        coordinator.lookup("00:1b:c5:00:00:01").map(|m| m.organization),
        Some("Converging".to_string())
    );

    let status = coordinator.status();
    assert_eq!(status.index.entries, 5);
    assert_eq!(status.index.prefix_lengths, vec![36, 24, 16]);
    assert!(status.refresh.last_updated.is_some());
    assert!(status.refresh.last_failure.is_none());
}

#[tokio::test]
async fn test_coordinator_start_without_data() {
    let source = spawn_source(StatusCode::BAD_GATEWAY, Vec::new()).await;
    let dir = tempfile::tempdir().unwrap();
    let coordinator = started_coordinator(&source, dir.path().join("manuf.gz")).await;

    assert!(coordinator.lookup("00:00:0C:11:22:33").is_none());

    let status = coordinator.status();
    assert_eq!(status.index.entries, 0);
    let failure = status.refresh.last_failure.expect("failure recorded");
    assert_eq!(failure.stage, Stage::Download);
    assert!(status.refresh.index_error.is_some());
}

#[tokio::test]
async fn test_api_health() {
    let source = spawn_source(StatusCode::OK, gzip(MANUF_V1)).await;
    let dir = tempfile::tempdir().unwrap();
    let base_url = spawn_api(started_coordinator(&source, dir.path().join("manuf.gz")).await).await;

    let resp = reqwest::get(format!("{base_url}/api/v1/health"))
        .await
        .expect("health request failed");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn test_api_lookup() {
    let source = spawn_source(StatusCode::OK, gzip(MANUF_V1)).await;
    let dir = tempfile::tempdir().unwrap();
    let base_url = spawn_api(started_coordinator(&source, dir.path().join("manuf.gz")).await).await;

    let resp = reqwest::get(format!("{base_url}/api/v1/lookup/00:00:55:11:22:33"))
        .await
        .expect("lookup request failed");
    assert_eq!(resp.status(), StatusCode::OK);
    let hit: OuiMatch = resp.json().await.unwrap();
    assert_eq!(
        hit,
        OuiMatch {
            prefix: "00:00:0C/16".to_string(),
            organization: "Xerox".to_string(),
            annotation: "Early cards".to_string(),
        }
    );

    let resp = reqwest::get(format!("{base_url}/api/v1/lookup/ac-de-48-01-02-03"))
        .await
        .unwrap();
    let hit: OuiMatch = resp.json().await.unwrap();
    assert_eq!(hit.organization, "Private");
    assert_eq!(hit.annotation, "");
}

#[tokio::test]
async fn test_api_lookup_misses_are_404() {
    let source = spawn_source(StatusCode::OK, gzip(MANUF_V1)).await;
    let dir = tempfile::tempdir().unwrap();
    let base_url = spawn_api(started_coordinator(&source, dir.path().join("manuf.gz")).await).await;

    for address in ["FF:00:0C:11:22:33", "not-hex", "12:34"] {
        let resp = reqwest::get(format!("{base_url}/api/v1/lookup/{address}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{address}");
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["code"], "not_found");
    }
}

#[tokio::test]
async fn test_api_status() {
    let source = spawn_source(StatusCode::OK, gzip(MANUF_V1)).await;
    let dir = tempfile::tempdir().unwrap();
    let base_url = spawn_api(started_coordinator(&source, dir.path().join("manuf.gz")).await).await;

    let body: Value = reqwest::get(format!("{base_url}/api/v1/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["source_url"], source.url.as_str());
    assert_eq!(body["schedule"], "@yearly");
    assert_eq!(body["index"]["entries"], 5);
    assert!(body["refresh"]["last_updated"].is_string());
    assert!(body["refresh"]["last_failure"].is_null());
}

#[tokio::test]
async fn test_api_refresh_swaps_index() {
    let source = spawn_source(StatusCode::OK, gzip(MANUF_V1)).await;
    let dir = tempfile::tempdir().unwrap();
    let base_url = spawn_api(started_coordinator(&source, dir.path().join("manuf.gz")).await).await;
    let client = reqwest::Client::new();

    source.respond_with(StatusCode::OK, gzip(MANUF_V2));
    let resp = client
        .post(format!("{base_url}/api/v1/refresh"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    // The rebuild happens in the background right after the rename.
    let mut swapped = false;
    for _ in 0..50 {
        let resp = client
            .get(format!("{base_url}/api/v1/lookup/52:54:00:12:34:56"))
            .send()
            .await
            .unwrap();
        if resp.status() == StatusCode::OK {
            swapped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(swapped, "new index was never served");

    let resp = client
        .get(format!("{base_url}/api/v1/lookup/00:00:0C:11:22:33"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_api_refresh_failure_keeps_serving() {
    let source = spawn_source(StatusCode::OK, gzip(MANUF_V1)).await;
    let dir = tempfile::tempdir().unwrap();
    let base_url = spawn_api(started_coordinator(&source, dir.path().join("manuf.gz")).await).await;
    let client = reqwest::Client::new();

    source.respond_with(StatusCode::SERVICE_UNAVAILABLE, Vec::new());
    let resp = client
        .post(format!("{base_url}/api/v1/refresh"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "bad_gateway");

    let resp = client
        .get(format!("{base_url}/api/v1/lookup/00:00:0C:11:22:33"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}
