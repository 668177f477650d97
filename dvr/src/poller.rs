//! Discovery poller.
//!
//! Every round asks the discovery layer for the feed servers currently
//! known and probes each of them, without waiting for one another.  A
//! probe is either a cheap `/check` (only the version token) or a full
//! `/status` scan.  Full scans happen on a slow global cadence, when a
//! check shows a change, or sooner when the transfer queue saw a file it
//! did not know about.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use vigil_common::config::MAX_PERIOD_SECS;
use vigil_common::discovery::Discover;
use vigil_common::protocol::{CheckResponse, FeedStatus};

use crate::error::fatal;
use crate::events::EventSink;
use crate::registry::Registry;
use crate::state::StateFile;
use crate::transfer::TransferQueue;

/// Length of the fast start period, after process start (seconds).
const START_PERIOD_SECS: i64 = 60;

/// Polling period during the start period, and the delay of a rushed
/// full scan (seconds).
const FAST_PERIOD_SECS: i64 = 10;

/// Period of the stale entries pruning (seconds).
const PRUNE_PERIOD_SECS: i64 = 10;

fn period(secs: u64) -> TimeDelta {
    TimeDelta::seconds(secs.clamp(1, MAX_PERIOD_SECS) as i64)
}

/// When to poll, and when to scan.
///
/// The full scan deadline is global: it is not possible to re-scan one
/// server without re-scanning all of them.  `None` means overdue.
#[derive(Debug, Clone)]
pub struct Schedule {
    start_period_end: DateTime<Utc>,
    next_discovery: Option<DateTime<Utc>>,
    next_full_scan: Option<DateTime<Utc>>,
    next_prune: Option<DateTime<Utc>>,
    check_period: TimeDelta,
    full_scan_period: TimeDelta,
}

impl Schedule {
    pub fn new(start: DateTime<Utc>, check_period_secs: u64, full_scan_period_secs: u64) -> Self {
        Self {
            start_period_end: start + TimeDelta::seconds(START_PERIOD_SECS),
            next_discovery: None,
            next_full_scan: None,
            next_prune: None,
            check_period: period(check_period_secs),
            full_scan_period: period(full_scan_period_secs),
        }
    }

    pub fn in_start_period(&self, now: DateTime<Utc>) -> bool {
        now <= self.start_period_end
    }

    pub fn full_scan_due(&self, now: DateTime<Utc>) -> bool {
        self.next_full_scan.is_none_or(|t| now >= t)
    }

    #[cfg(test)]
    pub fn next_full_scan(&self) -> Option<DateTime<Utc>> {
        self.next_full_scan
    }

    fn prune_due(&mut self, now: DateTime<Utc>) -> bool {
        if self.next_prune.is_some_and(|t| now < t) {
            return false;
        }
        self.next_prune = Some(now + TimeDelta::seconds(PRUNE_PERIOD_SECS));
        true
    }

    /// Start a polling round if one is due.  Returns whether the servers
    /// must get a full scan (`Some(true)`) or only a check.
    pub fn begin_round(&mut self, now: DateTime<Utc>) -> Option<bool> {
        let full_scan = self.full_scan_due(now);
        if !full_scan && self.next_discovery.is_some_and(|t| now < t) {
            return None;
        }
        let period = if self.in_start_period(now) {
            TimeDelta::seconds(FAST_PERIOD_SECS)
        } else {
            self.check_period
        };
        self.next_discovery = Some(now + period);
        Some(full_scan)
    }

    /// Close a round that polled `polled` servers.
    pub fn end_round(&mut self, now: DateTime<Utc>, polled: usize) {
        if polled > 0 {
            if self.full_scan_due(now) {
                self.next_full_scan = Some(now + self.full_scan_period);
            }
        } else if self.next_full_scan.is_some() {
            debug!("Lost contact with all feed servers, resync");
            self.next_full_scan = None;
        }
    }

    /// Bring the next full scan forward to at most a few seconds from now.
    pub fn rush(&mut self, now: DateTime<Utc>) {
        let soon = now + TimeDelta::seconds(FAST_PERIOD_SECS);
        if let Some(t) = self.next_full_scan {
            if t > soon {
                self.next_full_scan = Some(soon);
            }
        }
    }
}

#[derive(Clone)]
pub struct Poller {
    client: reqwest::Client,
    service: String,
    peers: Arc<dyn Discover>,
    registry: Arc<Mutex<Registry>>,
    queue: Arc<Mutex<TransferQueue>>,
    schedule: Arc<Mutex<Schedule>>,
    state: StateFile,
    events: Arc<dyn EventSink>,
}

impl Poller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: reqwest::Client,
        service: &str,
        peers: Arc<dyn Discover>,
        registry: Arc<Mutex<Registry>>,
        queue: Arc<Mutex<TransferQueue>>,
        schedule: Schedule,
        state: StateFile,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            client,
            service: service.to_string(),
            peers,
            registry,
            queue,
            schedule: Arc::new(Mutex::new(schedule)),
            state,
            events,
        }
    }

    /// One background tick: prune, save the state, maybe poll.
    ///
    /// The probes run as separate tasks; this returns once they are issued.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let (prune, starting) = {
            let mut schedule = self.schedule.lock().await;
            (schedule.prune_due(now), schedule.in_start_period(now))
        };
        if prune {
            if let Err(e) = self.registry.lock().await.prune_stale(now) {
                fatal(&e);
            }
        }

        // Saving during the start period could lose cameras not yet
        // confirmed by their server.
        if !starting {
            let changed = {
                let mut registry = self.registry.lock().await;
                registry.take_state_changed().then(|| registry.camera_names())
            };
            if let Some(names) = changed {
                if let Err(e) = self.state.save(&names) {
                    warn!("Cannot save state: {e:#}");
                    self.registry.lock().await.mark_state_changed();
                }
            }
        }

        let mut schedule = self.schedule.lock().await;
        let Some(full_scan) = schedule.begin_round(now) else {
            return;
        };
        debug!("Proceeding with discovery of service {}", self.service);
        let urls = self.peers.discovered();
        for url in &urls {
            let poller = self.clone();
            let url = url.clone();
            tokio::spawn(async move {
                if full_scan {
                    poller.scan(&url).await;
                } else {
                    poller.check(&url).await;
                }
            });
        }
        schedule.end_round(now, urls.len());
    }

    /// Cheap probe: only scan when the version token changed.
    pub async fn check(&self, url: &str) {
        let target = format!("{url}/check");
        debug!("Attempting discovery at {target}");
        let response = match self.client.get(&target).send().await {
            Ok(r) => r,
            Err(e) => {
                self.events.trace(url, &e.to_string());
                return;
            }
        };
        let status = response.status();
        if status != StatusCode::OK {
            // 401: the server does not support /check.
            self.events.trace(url, &format!("HTTP error {}", status.as_u16()));
            return self.scan(url).await;
        }
        let check: CheckResponse = match response.json().await {
            Ok(c) => c,
            Err(e) => {
                self.events.trace(url, &format!("JSON error, {e}"));
                return self.scan(url).await;
            }
        };
        let Some(updated) = check.updated else {
            self.events.trace(url, "no updated field");
            return self.scan(url).await;
        };

        let mut registry = self.registry.lock().await;
        if registry.is_up_to_date(&check.host, updated) {
            registry.refresh_seen(&check.host, Utc::now());
        } else {
            drop(registry);
            self.scan(url).await;
        }
    }

    /// Full status scan.  Malformed answers are skipped for this round.
    pub async fn scan(&self, url: &str) {
        let target = format!("{url}/status");
        debug!("Attempting status collection at {target}");
        let response = match self.client.get(&target).send().await {
            Ok(r) => r,
            Err(e) => {
                self.events.trace(url, &e.to_string());
                return;
            }
        };
        if response.status() != StatusCode::OK {
            self.events
                .trace(url, &format!("HTTP error {}", response.status().as_u16()));
            return;
        }
        let status: FeedStatus = match response.json().await {
            Ok(s) => s,
            Err(e) => {
                self.events.trace(url, &format!("JSON error, {e}"));
                return;
            }
        };

        let now = Utc::now();
        let rush = {
            let mut registry = self.registry.lock().await;
            let mut queue = self.queue.lock().await;
            apply_status(&mut registry, &mut queue, self.events.as_ref(), url, &status, now)
        };
        if rush {
            self.schedule.lock().await.rush(now);
        }
    }
}

/// Merge a feed server status into the registry and the transfer queue.
///
/// Returns true if a full scan should come soon: some recording was not
/// known to the queue.
pub fn apply_status(
    registry: &mut Registry,
    queue: &mut TransferQueue,
    events: &dyn EventSink,
    feed_url: &str,
    status: &FeedStatus,
    now: DateTime<Utc>,
) -> bool {
    let host = status.host.as_str();
    let console = status.cctv.console.as_str();
    if registry.record_server_seen(host, status.updated, console, status.cctv.free_space_text(), now)
    {
        events.event("CCTV", host, "ADDED", &format!("ADMIN {console}"));
    }

    let devices = status.cctv.devices();
    if devices.is_empty() {
        events.trace(feed_url, "no feed data");
        return false;
    }
    for (device, stream) in devices {
        let name = format!("{host}:{device}");
        if registry.register_camera(&name, Some(host), stream, now) {
            debug!("Feed {device} discovered at {stream}");
            events.event("FEED", &name, "ADDED", &format!("STREAM {stream}"));
        }
    }
    registry.disown_unconfirmed(host, now);

    let mut rush = false;
    let seconds = now.timestamp();
    for recording in status.cctv.recordings().iter().rev() {
        if !recording.is_stable(seconds) {
            continue;
        }
        rush |= queue
            .notify(feed_url, &recording.path, recording.size, now)
            .wants_rescan();
    }
    rush
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemorySink;
    use crate::transfer::TransferState;
    use axum::http::StatusCode as HttpStatus;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;
    use vigil_common::discovery::StaticPeers;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_717_000_000 + secs, 0).unwrap()
    }

    fn status(host: &str, updated: i64, devices: &[&str], recordings: serde_json::Value) -> FeedStatus {
        let feeds: serde_json::Map<String, serde_json::Value> = devices
            .iter()
            .map(|d| (d.to_string(), json!(format!("rtsp://{host}/{d}"))))
            .collect();
        serde_json::from_value(json!({
            "host": host,
            "updated": updated,
            "cctv": {
                "console": format!("http://{host}/cctv/"),
                "available": "2G",
                "feeds": feeds,
                "recordings": recordings,
            }
        }))
        .unwrap()
    }

    struct Fixture {
        registry: Registry,
        queue: TransferQueue,
        sink: Arc<MemorySink>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::default());
        Fixture {
            registry: Registry::new(sink.clone()),
            queue: TransferQueue::new(dir.path(), 16, sink.clone()),
            sink,
            _dir: dir,
        }
    }

    #[test]
    fn test_scan_registers_server_and_cameras() {
        let mut f = fixture();
        let s = status("garage", 5, &["front", "back"], json!([]));
        apply_status(&mut f.registry, &mut f.queue, f.sink.as_ref(), "http://garage", &s, t(0));

        let server = f.registry.server("garage").unwrap();
        assert_eq!(server.free_space_mb, 2048);
        assert_eq!(server.updated, 5);
        assert_eq!(f.registry.camera("garage:front").unwrap().owner.as_deref(), Some("garage"));
        assert!(f.sink.has("CCTV", "garage", "ADDED"));
        assert_eq!(f.sink.count("FEED", "ADDED"), 2);

        // Same status again: nothing new to report.
        apply_status(&mut f.registry, &mut f.queue, f.sink.as_ref(), "http://garage", &s, t(30));
        assert_eq!(f.sink.count("CCTV", "ADDED"), 1);
        assert_eq!(f.sink.count("FEED", "ADDED"), 2);
    }

    #[test]
    fn test_camera_dropped_from_status_is_disowned() {
        let mut f = fixture();
        let both = status("garage", 1, &["front", "back"], json!([]));
        apply_status(&mut f.registry, &mut f.queue, f.sink.as_ref(), "http://garage", &both, t(0));

        let front_only = status("garage", 2, &["front"], json!([]));
        apply_status(&mut f.registry, &mut f.queue, f.sink.as_ref(), "http://garage", &front_only, t(30));

        let back = f.registry.camera("garage:back").unwrap();
        assert_eq!(back.owner, None);
        assert_eq!(back.url, "");
        assert!(f.sink.has("FEED", "garage:back", "PRUNED"));
        assert!(f.registry.camera_names().contains(&"garage:back".to_string()));
        assert_eq!(
            f.registry.camera("garage:front").unwrap().owner.as_deref(),
            Some("garage")
        );
    }

    #[test]
    fn test_empty_feeds_skip_recordings() {
        let mut f = fixture();
        let s = status("garage", 1, &[], json!([[0, "2024/05/01/a.mp4", 10, true]]));
        let rush = apply_status(&mut f.registry, &mut f.queue, f.sink.as_ref(), "http://garage", &s, t(0));
        assert!(!rush);
        assert!(f.registry.server("garage").is_some());
        assert_eq!(f.queue.pending_len(), 0);
        assert_eq!(f.sink.trace_count(), 1);
    }

    #[test]
    fn test_only_stable_recordings_are_queued() {
        let mut f = fixture();
        let now = t(1000);
        let recent = now.timestamp() - 10;
        let old = now.timestamp() - 600;
        let s = status(
            "garage",
            1,
            &["front"],
            json!([
                [old, "2024/05/01/10:00:00-front.mp4", 100],
                [recent, "2024/05/01/10:09:50-front.mp4", 100],
                [recent, "2024/05/01/10:09:51-front.mp4", 100, true],
                [old, "2024/05/01/10:00:01-front.mp4", 100, false],
            ]),
        );
        let rush = apply_status(&mut f.registry, &mut f.queue, f.sink.as_ref(), "http://garage", &s, now);

        assert!(rush);
        assert_eq!(f.queue.pending_len(), 2);
        // Listed newest last, queued newest first.
        let entries = f.queue.status();
        assert_eq!(entries[0].path, "2024/05/01/10:09:51-front.mp4");
        assert_eq!(entries[1].path, "2024/05/01/10:00:00-front.mp4");
        assert_eq!(entries[0].feed, "http://garage");
        assert_eq!(f.queue.find_pending(&entries[0].path).unwrap().state, TransferState::Pending);
    }

    #[test]
    fn test_known_recordings_do_not_rush() {
        let mut f = fixture();
        let s = status("garage", 1, &["front"], json!([[0, "2024/05/01/a.mp4", 10, true]]));
        assert!(apply_status(&mut f.registry, &mut f.queue, f.sink.as_ref(), "http://g", &s, t(0)));
        assert!(!apply_status(&mut f.registry, &mut f.queue, f.sink.as_ref(), "http://g", &s, t(5)));
    }

    #[test]
    fn test_schedule_fast_start_then_check_period() {
        let mut schedule = Schedule::new(t(0), 30, 300);

        // First round: full scan, the next one 10s later.
        assert_eq!(schedule.begin_round(t(0)), Some(true));
        schedule.end_round(t(0), 1);
        assert_eq!(schedule.next_full_scan(), Some(t(300)));
        assert_eq!(schedule.begin_round(t(5)), None);
        assert_eq!(schedule.begin_round(t(10)), Some(false));
        schedule.end_round(t(10), 1);

        // After the start period: every 30s.
        assert_eq!(schedule.begin_round(t(70)), Some(false));
        schedule.end_round(t(70), 1);
        assert_eq!(schedule.begin_round(t(90)), None);
        assert_eq!(schedule.begin_round(t(100)), Some(false));
        schedule.end_round(t(100), 1);

        // Full scan deadline reached: forced even between checks.
        assert_eq!(schedule.begin_round(t(300)), Some(true));
        schedule.end_round(t(300), 1);
        assert_eq!(schedule.next_full_scan(), Some(t(600)));
    }

    #[test]
    fn test_schedule_resync_when_nothing_polled() {
        let mut schedule = Schedule::new(t(0), 30, 300);
        assert_eq!(schedule.begin_round(t(0)), Some(true));
        schedule.end_round(t(0), 2);
        assert!(schedule.next_full_scan().is_some());

        assert_eq!(schedule.begin_round(t(100)), Some(false));
        schedule.end_round(t(100), 0);
        assert_eq!(schedule.next_full_scan(), None);

        // Overdue: every tick polls until a server shows up again.
        assert_eq!(schedule.begin_round(t(101)), Some(true));
        schedule.end_round(t(101), 1);
        assert_eq!(schedule.next_full_scan(), Some(t(401)));
    }

    #[test]
    fn test_rush_never_postpones() {
        let mut schedule = Schedule::new(t(0), 30, 300);
        schedule.begin_round(t(0));
        schedule.end_round(t(0), 1);

        schedule.rush(t(100));
        assert_eq!(schedule.next_full_scan(), Some(t(110)));
        schedule.rush(t(105));
        assert_eq!(schedule.next_full_scan(), Some(t(110)));

        let mut overdue = Schedule::new(t(0), 30, 300);
        overdue.rush(t(0));
        assert_eq!(overdue.next_full_scan(), None);
    }

    /// A feed server with a working /check, counting the /status calls.
    async fn feed_server(check: HttpStatus, updated: i64) -> (String, Arc<AtomicUsize>) {
        let scans = Arc::new(AtomicUsize::new(0));
        let counter = scans.clone();
        let app = Router::new()
            .route(
                "/check",
                get(move || async move { (check, Json(json!({"host": "garage", "updated": updated}))) }),
            )
            .route(
                "/status",
                get(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Json(json!({
                            "host": "garage",
                            "updated": 7,
                            "cctv": {"console": "http://garage/", "feeds": {"front": "rtsp://garage/front"}}
                        }))
                    }
                }),
            );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), scans)
    }

    fn poller(url: &str, sink: Arc<MemorySink>, dir: &tempfile::TempDir) -> Poller {
        Poller::new(
            crate::fetch::build_client().unwrap(),
            "cctv",
            Arc::new(StaticPeers(vec![url.to_string()])),
            Arc::new(Mutex::new(Registry::new(sink.clone()))),
            Arc::new(Mutex::new(TransferQueue::new(dir.path(), 16, sink.clone()))),
            Schedule::new(Utc::now(), 30, 300),
            StateFile::new(dir.path().join("state.json")),
            sink,
        )
    }

    #[tokio::test]
    async fn test_check_scans_only_on_token_change() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::default());
        let (url, scans) = feed_server(HttpStatus::OK, 7).await;
        let poller = poller(&url, sink.clone(), &dir);

        // Unknown server: the check leads to a scan.
        poller.check(&url).await;
        assert_eq!(scans.load(Ordering::SeqCst), 1);
        assert!(poller.registry.lock().await.server("garage").is_some());

        // Same token: refresh only.
        poller.check(&url).await;
        assert_eq!(scans.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsupported_check_forces_scan() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::default());
        let (url, scans) = feed_server(HttpStatus::UNAUTHORIZED, 7).await;
        let poller = poller(&url, sink.clone(), &dir);

        poller.check(&url).await;
        poller.check(&url).await;
        assert_eq!(scans.load(Ordering::SeqCst), 2);
        assert_eq!(sink.count("CCTV", "ADDED"), 1);
    }

    #[tokio::test]
    async fn test_unreachable_server_is_only_traced() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::default());
        let poller = poller("http://127.0.0.1:1", sink.clone(), &dir);

        poller.check("http://127.0.0.1:1").await;
        poller.scan("http://127.0.0.1:1").await;
        assert_eq!(sink.trace_count(), 2);
        assert_eq!(poller.registry.lock().await.servers().count(), 0);
    }

    #[tokio::test]
    async fn test_failed_state_save_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::default());
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let poller = Poller::new(
            crate::fetch::build_client().unwrap(),
            "cctv",
            Arc::new(StaticPeers(Vec::new())),
            Arc::new(Mutex::new(Registry::new(sink.clone()))),
            Arc::new(Mutex::new(TransferQueue::new(dir.path(), 16, sink.clone()))),
            Schedule::new(Utc::now(), 30, 300),
            StateFile::new(blocker.join("state.json")),
            sink,
        );
        let start = Utc::now();
        poller
            .registry
            .lock()
            .await
            .register_camera("garage:front", Some("garage"), "rtsp://garage/front", start);

        // The state directory cannot be created over a regular file.
        poller.tick(start + TimeDelta::seconds(61)).await;
        let state = StateFile::new(blocker.join("state.json"));
        assert!(state.load().is_empty());

        std::fs::remove_file(&blocker).unwrap();
        poller.tick(start + TimeDelta::seconds(62)).await;
        assert_eq!(state.load(), vec!["garage:front".to_string()]);
    }

    #[test]
    fn test_schedule_bounds_huge_periods() {
        let mut schedule = Schedule::new(t(0), u64::MAX, u64::MAX);
        assert_eq!(schedule.begin_round(t(0)), Some(true));
        schedule.end_round(t(0), 1);
        assert_eq!(schedule.next_full_scan(), Some(t(MAX_PERIOD_SECS as i64)));
    }

    #[tokio::test]
    async fn test_tick_polls_discovered_servers() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::default());
        let (url, scans) = feed_server(HttpStatus::OK, 7).await;
        let poller = poller(&url, sink.clone(), &dir);

        poller.tick(Utc::now()).await;
        for _ in 0..50 {
            if scans.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(scans.load(Ordering::SeqCst), 1);
        assert!(poller.schedule.lock().await.next_full_scan().is_some());
    }
}
