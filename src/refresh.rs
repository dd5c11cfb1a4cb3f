use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::api::latency::FetchLatency;
use crate::config::Config;
use crate::error::{AppError, Result};
use crate::fetcher::ProjectionSource;
use crate::movement::{calculate_line_movements, summarize};
use crate::state::{Snapshot, SnapshotStore};
use crate::types::{LineMovement, MovementSummary};

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Time source for the staleness policy. Injected so tests can move time by hand.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ---------------------------------------------------------------------------
// Reports & status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct RefreshSettings {
    /// A held, non-empty batch younger than this is not re-fetched unless forced.
    pub staleness: Duration,
    /// Expiry is reported as `AppError::FetchTimeout`.
    pub fetch_timeout: Duration,
}

impl RefreshSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            staleness: cfg.staleness,
            fetch_timeout: cfg.fetch_timeout,
        }
    }
}

/// Result of one successful refresh: the new batch and its movements against
/// the batch it replaced.
#[derive(Debug)]
pub struct RefreshReport {
    pub batch: Arc<Snapshot>,
    pub movements: HashMap<String, LineMovement>,
    pub fetched_at: DateTime<Utc>,
    pub fetch_duration: Duration,
}

impl RefreshReport {
    pub fn summary(&self) -> MovementSummary {
        summarize(&self.movements, self.batch.projections())
    }

    pub fn movement(&self, projection_id: &str) -> LineMovement {
        self.movements
            .get(projection_id)
            .copied()
            .unwrap_or(LineMovement::NONE)
    }
}

#[derive(Debug)]
pub enum RefreshOutcome {
    Refreshed(Arc<RefreshReport>),
    /// Skipped: the held batch is inside the staleness threshold.
    Fresh,
    /// Dropped: another refresh was already fetching.
    InFlight,
}

impl RefreshOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RefreshOutcome::Refreshed(_) => "refreshed",
            RefreshOutcome::Fresh => "fresh",
            RefreshOutcome::InFlight => "in_flight",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshStatus {
    pub last_updated: Option<DateTime<Utc>>,
    pub is_stale: bool,
    pub in_flight: bool,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub projection_count: usize,
}

#[derive(Debug, Default)]
struct RefreshState {
    last_success: Option<DateTime<Utc>>,
    last_error: Option<String>,
    consecutive_failures: u32,
    latest: Option<Arc<RefreshReport>>,
}

/// Clears the in-flight flag when the refresh that claimed it ends, however it ends.
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// ProjectionRefresher
// ---------------------------------------------------------------------------

/// Pulls fresh batches, diffs them against the snapshot store and swaps the
/// snapshot. At most one fetch is in flight; overlapping requests are dropped.
pub struct ProjectionRefresher {
    source: Arc<dyn ProjectionSource>,
    store: Arc<SnapshotStore>,
    clock: Arc<dyn Clock>,
    settings: RefreshSettings,
    in_flight: Arc<AtomicBool>,
    state: Mutex<RefreshState>,
    report_tx: Option<mpsc::Sender<Arc<RefreshReport>>>,
    latency: Option<Arc<FetchLatency>>,
}

impl ProjectionRefresher {
    pub fn new(
        source: Arc<dyn ProjectionSource>,
        store: Arc<SnapshotStore>,
        clock: Arc<dyn Clock>,
        settings: RefreshSettings,
    ) -> Self {
        Self {
            source,
            store,
            clock,
            settings,
            in_flight: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(RefreshState::default()),
            report_tx: None,
            latency: None,
        }
    }

    /// Publish every successful report on `tx`. Full channels drop the report.
    pub fn with_report_channel(mut self, tx: mpsc::Sender<Arc<RefreshReport>>) -> Self {
        self.report_tx = Some(tx);
        self
    }

    pub fn with_latency(mut self, latency: Arc<FetchLatency>) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Periodic non-forced refresh loop. The first tick fires immediately.
    pub async fn run(self: Arc<Self>, every: Duration) {
        let mut ticker = interval(every);

        loop {
            ticker.tick().await;
            match self.refresh(false).await {
                Ok(outcome) => debug!(outcome = outcome.label(), "Scheduled refresh tick"),
                Err(e) => error!("Projection refresh failed: {e}"),
            }
        }
    }

    /// Fetch, diff and replace unless the held batch is fresh (ignored when
    /// `force`) or another refresh is running.
    ///
    /// Once the fetch starts it runs on its own task: dropping the returned
    /// future (a disconnected HTTP client) does not abandon it, and the
    /// outcome still lands in the store and in `status()`.
    pub async fn refresh(self: &Arc<Self>, force: bool) -> Result<RefreshOutcome> {
        let Some(guard) = InFlightGuard::acquire(&self.in_flight) else {
            debug!(force, "Refresh already in flight, dropping request");
            return Ok(RefreshOutcome::InFlight);
        };

        if !force && self.is_fresh(self.clock.now()) {
            return Ok(RefreshOutcome::Fresh);
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            this.fetch_and_replace().await
        })
        .await?
    }

    async fn fetch_and_replace(&self) -> Result<RefreshOutcome> {
        let started = Instant::now();
        let fetched = match tokio::time::timeout(self.settings.fetch_timeout, self.source.fetch()).await {
            Ok(Ok(batch)) => batch,
            Ok(Err(e)) => return Err(self.record_failure(e)),
            Err(_) => return Err(self.record_failure(AppError::FetchTimeout(self.settings.fetch_timeout))),
        };
        let fetch_duration = started.elapsed();
        if let Some(latency) = &self.latency {
            latency.record(fetch_duration);
        }

        let baseline = self.store.snapshot();
        let movements = calculate_line_movements(&baseline, &fetched);
        self.store.replace(fetched);

        let report = Arc::new(RefreshReport {
            batch: self.store.snapshot(),
            movements,
            fetched_at: self.clock.now(),
            fetch_duration,
        });

        {
            let mut state = self.lock_state();
            state.last_success = Some(report.fetched_at);
            state.last_error = None;
            state.consecutive_failures = 0;
            state.latest = Some(Arc::clone(&report));
        }

        let summary = report.summary();
        info!(
            total = report.batch.len(),
            moved = summary.total(),
            up = summary.up,
            down = summary.down,
            previous = baseline.len(),
            fetch_ms = fetch_duration.as_millis() as u64,
            "Projection refresh complete: {} lines, {} moved ({} up, {} down)",
            report.batch.len(),
            summary.total(),
            summary.up,
            summary.down,
        );

        if let Some(tx) = &self.report_tx {
            if let Err(e) = tx.try_send(Arc::clone(&report)) {
                warn!("Refresh report channel full or closed: {e}");
            }
        }

        Ok(RefreshOutcome::Refreshed(report))
    }

    /// Current batch plus the movements of the diff that produced it.
    pub fn latest(&self) -> Option<Arc<RefreshReport>> {
        self.lock_state().latest.clone()
    }

    pub fn is_refreshing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn status(&self) -> RefreshStatus {
        let now = self.clock.now();
        let is_stale = !self.is_fresh(now);
        let state = self.lock_state();
        RefreshStatus {
            last_updated: state.last_success,
            is_stale,
            in_flight: self.is_refreshing(),
            last_error: state.last_error.clone(),
            consecutive_failures: state.consecutive_failures,
            projection_count: self.store.len(),
        }
    }

    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        if self.store.is_empty() {
            return false;
        }
        let Some(last) = self.lock_state().last_success else {
            return false;
        };
        // A clock that stepped backwards reads as "just fetched".
        match (now - last).to_std() {
            Ok(elapsed) => elapsed < self.settings.staleness,
            Err(_) => true,
        }
    }

    fn record_failure(&self, err: AppError) -> AppError {
        let mut state = self.lock_state();
        state.last_error = Some(err.to_string());
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        warn!(
            consecutive_failures = state.consecutive_failures,
            held = self.store.len(),
            "Fetch failed, keeping previous snapshot: {err}",
        );
        err
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RefreshState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::types::{Direction, Projection};

    struct ManualClock(Mutex<DateTime<Utc>>);

    impl ManualClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Utc::now())))
        }

        fn advance(&self, by: Duration) {
            let mut now = self.0.lock().unwrap();
            *now += chrono::Duration::from_std(by).unwrap();
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    /// Replays scripted fetch results in order. An exhausted script fails.
    #[derive(Default)]
    struct ScriptedSource {
        script: Mutex<VecDeque<Result<Vec<Projection>>>>,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        delay: Option<Duration>,
    }

    impl ScriptedSource {
        fn with(batches: Vec<Result<Vec<Projection>>>) -> Self {
            Self {
                script: Mutex::new(batches.into()),
                ..Self::default()
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProjectionSource for ScriptedSource {
        async fn fetch(&self) -> Result<Vec<Projection>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(AppError::FetchFailure("script exhausted".to_string())))
        }
    }

    fn batch(lines: &[(&str, f64)]) -> Vec<Projection> {
        lines
            .iter()
            .map(|&(id, l)| Projection::new(id, "Points", Some(l)))
            .collect()
    }

    fn settings() -> RefreshSettings {
        RefreshSettings {
            staleness: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(10),
        }
    }

    fn refresher(
        source: Arc<ScriptedSource>,
        clock: Arc<ManualClock>,
    ) -> (Arc<ProjectionRefresher>, Arc<SnapshotStore>) {
        let store = SnapshotStore::new();
        let r = ProjectionRefresher::new(source, Arc::clone(&store), clock, settings());
        (Arc::new(r), store)
    }

    fn expect_report(outcome: RefreshOutcome) -> Arc<RefreshReport> {
        match outcome {
            RefreshOutcome::Refreshed(report) => report,
            other => panic!("expected a refresh, got {}", other.label()),
        }
    }

    fn lines(store: &SnapshotStore) -> Vec<(String, Option<f64>)> {
        store
            .snapshot()
            .projections()
            .iter()
            .map(|p| (p.id.clone(), p.line_score))
            .collect()
    }

    #[tokio::test]
    async fn first_refresh_has_no_prior_data() {
        let source = Arc::new(ScriptedSource::with(vec![Ok(batch(&[("p1", 24.5)]))]));
        let (r, store) = refresher(Arc::clone(&source), ManualClock::new());

        let report = expect_report(r.refresh(false).await.unwrap());

        assert_eq!(report.movement("p1"), LineMovement::NONE);
        assert_eq!(store.len(), 1);
        let status = r.status();
        assert!(status.last_updated.is_some());
        assert!(!status.is_stale);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn second_batch_is_diffed_and_replaces_snapshot() {
        let source = Arc::new(ScriptedSource::with(vec![
            Ok(batch(&[("p1", 10.0), ("p2", 5.0)])),
            Ok(batch(&[("p1", 10.0), ("p2", 3.5), ("p3", 7.0)])),
        ]));
        let (r, store) = refresher(source, ManualClock::new());

        r.refresh(true).await.unwrap();
        let report = expect_report(r.refresh(true).await.unwrap());

        assert_eq!(report.movement("p1"), LineMovement::NONE);
        assert_eq!(report.movement("p2"), LineMovement { direction: Direction::Down, difference: 1.5 });
        assert_eq!(report.movement("p3"), LineMovement::NONE);
        assert_eq!(
            lines(&store),
            vec![
                ("p1".to_string(), Some(10.0)),
                ("p2".to_string(), Some(3.5)),
                ("p3".to_string(), Some(7.0)),
            ]
        );
        assert_eq!(report.summary().down, 1);
    }

    #[tokio::test]
    async fn fresh_batch_is_not_refetched_until_stale() {
        let source = Arc::new(ScriptedSource::with(vec![
            Ok(batch(&[("p1", 24.5)])),
            Ok(batch(&[("p1", 26.0)])),
            Ok(batch(&[("p1", 27.0)])),
        ]));
        let clock = ManualClock::new();
        let (r, _store) = refresher(Arc::clone(&source), Arc::clone(&clock));

        r.refresh(false).await.unwrap();
        clock.advance(Duration::from_secs(120));
        assert!(matches!(r.refresh(false).await.unwrap(), RefreshOutcome::Fresh));
        assert_eq!(source.calls(), 1);

        // Forced refresh bypasses the threshold.
        let report = expect_report(r.refresh(true).await.unwrap());
        assert_eq!(report.movement("p1").direction, Direction::Up);
        assert_eq!(source.calls(), 2);

        clock.advance(Duration::from_secs(301));
        assert!(r.status().is_stale);
        let report = expect_report(r.refresh(false).await.unwrap());
        assert_eq!(report.movement("p1").difference, 1.0);
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn empty_batch_never_counts_as_fresh() {
        let source = Arc::new(ScriptedSource::with(vec![Ok(Vec::new()), Ok(batch(&[("p1", 1.5)]))]));
        let (r, store) = refresher(Arc::clone(&source), ManualClock::new());

        r.refresh(false).await.unwrap();
        expect_report(r.refresh(false).await.unwrap());
        assert_eq!(source.calls(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_snapshot_and_records_error() {
        let source = Arc::new(ScriptedSource::with(vec![
            Ok(batch(&[("p1", 24.5)])),
            Err(AppError::FetchFailure("partner API returned HTTP 503".to_string())),
            Ok(batch(&[("p1", 25.5)])),
        ]));
        let (r, store) = refresher(source, ManualClock::new());
        r.refresh(true).await.unwrap();

        let err = r.refresh(true).await.unwrap_err();
        assert!(err.is_fetch_failure());
        assert_eq!(lines(&store), vec![("p1".to_string(), Some(24.5))]);
        let status = r.status();
        assert_eq!(status.consecutive_failures, 1);
        assert!(status.last_error.as_deref().is_some_and(|e| e.contains("503")));
        // The last good report is still served.
        assert!(r.latest().is_some());

        // Recovery diffs against the preserved snapshot and clears the error.
        let report = expect_report(r.refresh(true).await.unwrap());
        assert_eq!(report.movement("p1"), LineMovement { direction: Direction::Up, difference: 1.0 });
        assert!(r.status().last_error.is_none());
    }

    #[tokio::test]
    async fn slow_fetch_times_out_as_fetch_failure() {
        let source = Arc::new(ScriptedSource {
            script: Mutex::new(vec![Ok(batch(&[("p1", 30.5)]))].into()),
            delay: Some(Duration::from_secs(5)),
            ..ScriptedSource::default()
        });
        let store = SnapshotStore::new();
        store.replace(batch(&[("p1", 24.5)]));
        let r = Arc::new(ProjectionRefresher::new(
            source,
            Arc::clone(&store),
            ManualClock::new(),
            RefreshSettings {
                staleness: Duration::from_secs(300),
                fetch_timeout: Duration::from_millis(50),
            },
        ));

        let err = r.refresh(true).await.unwrap_err();

        assert!(matches!(err, AppError::FetchTimeout(_)));
        assert_eq!(lines(&store), vec![("p1".to_string(), Some(24.5))]);
        assert!(!r.is_refreshing());
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_fetch() {
        let gate = Arc::new(Notify::new());
        let source = Arc::new(ScriptedSource {
            script: Mutex::new(vec![Ok(batch(&[("p1", 24.5)])), Ok(batch(&[("p1", 99.5)]))].into()),
            gate: Some(Arc::clone(&gate)),
            ..ScriptedSource::default()
        });
        let (r, store) = refresher(Arc::clone(&source), ManualClock::new());

        let first = tokio::spawn({
            let r = Arc::clone(&r);
            async move { r.refresh(true).await }
        });
        while !r.is_refreshing() {
            tokio::task::yield_now().await;
        }

        let second = r.refresh(true).await.unwrap();
        assert!(matches!(second, RefreshOutcome::InFlight));

        gate.notify_one();
        let first = first.await.unwrap().unwrap();
        expect_report(first);

        assert_eq!(source.calls(), 1);
        assert_eq!(lines(&store), vec![("p1".to_string(), Some(24.5))]);
        assert!(!r.is_refreshing());
    }

    #[tokio::test]
    async fn dropped_caller_does_not_cancel_the_fetch() {
        let source = Arc::new(ScriptedSource {
            script: Mutex::new(vec![Ok(batch(&[("p1", 26.0)]))].into()),
            delay: Some(Duration::from_millis(200)),
            ..ScriptedSource::default()
        });
        let (r, store) = refresher(Arc::clone(&source), ManualClock::new());
        store.replace(batch(&[("p1", 24.5)]));

        // The caller gives up long before the upstream answers.
        let abandoned = tokio::time::timeout(Duration::from_millis(50), r.refresh(true)).await;
        assert!(abandoned.is_err());
        assert!(r.is_refreshing());

        while r.is_refreshing() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(source.calls(), 1);
        assert_eq!(lines(&store), vec![("p1".to_string(), Some(26.0))]);
        let status = r.status();
        assert!(status.last_updated.is_some());
        assert!(status.last_error.is_none());
        let report = r.latest().expect("report kept");
        assert_eq!(report.movement("p1"), LineMovement { direction: Direction::Up, difference: 1.5 });
    }

    #[tokio::test]
    async fn repeated_replace_gives_identical_diffs() {
        let store = SnapshotStore::new();
        let base = batch(&[("p1", 10.0), ("p2", 5.0)]);
        let next = batch(&[("p1", 11.5), ("p2", 5.0)]);

        store.replace(base.clone());
        let once = calculate_line_movements(&store.snapshot(), &next);
        store.replace(base.clone());
        store.replace(base);
        let twice = calculate_line_movements(&store.snapshot(), &next);

        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn reports_are_published() {
        let source = Arc::new(ScriptedSource::with(vec![Ok(batch(&[("p1", 24.5)]))]));
        let (tx, mut rx) = mpsc::channel(4);
        let r = Arc::new(
            ProjectionRefresher::new(source, SnapshotStore::new(), ManualClock::new(), settings())
                .with_report_channel(tx),
        );

        r.refresh(false).await.unwrap();

        let report = rx.try_recv().expect("report published");
        assert_eq!(report.batch.len(), 1);
    }
}
