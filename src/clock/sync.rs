//! Clock offset estimation against the server's `Date` header.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{self, Instant};

use crate::clock::{SystemClock, WallClock};
use crate::config::ClockConfig;
use crate::error::{FlowError, FlowResult};
use crate::lifecycle::cancel::CancelToken;
use crate::observability::metrics::Observer;
use crate::resilience::timeouts::with_deadline;
use crate::transport::{ApiRequest, Dispatch};

/// Result of one successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockOffset {
    /// Server time minus local time.
    pub offset: chrono::Duration,
    pub round_trip: Duration,
    /// Local wall time at which the probe response arrived.
    pub measured_at: DateTime<Utc>,
    /// Monotonic instant the probe was sent. Orders overlapping probes.
    pub sent_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Unsynchronized,
    Synchronized(ClockOffset),
}

impl ClockState {
    pub fn is_synchronized(&self) -> bool {
        matches!(self, ClockState::Synchronized(_))
    }

    /// Offset to apply; zero until the first successful probe.
    pub fn offset(&self) -> chrono::Duration {
        match self {
            ClockState::Unsynchronized => chrono::Duration::zero(),
            ClockState::Synchronized(sample) => sample.offset,
        }
    }
}

/// Estimates and serves the local/server clock offset.
pub struct ClockSynchronizer {
    dispatcher: Arc<dyn Dispatch>,
    clock: Arc<dyn WallClock>,
    config: ClockConfig,
    state: Mutex<ClockState>,
    observer: Arc<dyn Observer>,
}

impl ClockSynchronizer {
    pub fn new(dispatcher: Arc<dyn Dispatch>, config: ClockConfig, observer: Arc<dyn Observer>) -> Self {
        Self::with_clock(dispatcher, Arc::new(SystemClock), config, observer)
    }

    pub fn with_clock(
        dispatcher: Arc<dyn Dispatch>,
        clock: Arc<dyn WallClock>,
        config: ClockConfig,
        observer: Arc<dyn Observer>,
    ) -> Self {
        Self {
            dispatcher,
            clock,
            config,
            state: Mutex::new(ClockState::Unsynchronized),
            observer,
        }
    }

    pub fn state(&self) -> ClockState {
        *self.state.lock().expect("clock state mutex poisoned")
    }

    pub fn offset(&self) -> chrono::Duration {
        self.state().offset()
    }

    /// Local time corrected by the last good offset.
    pub fn corrected_now(&self) -> DateTime<Utc> {
        self.clock.now() + self.offset()
    }

    /// Probe once. On success the offset is replaced; on failure it is kept
    /// and a warning is logged.
    ///
    /// Returns the sample in effect afterwards. When probes overlap, a sample
    /// sent before the current one is discarded even if it arrives later.
    pub async fn sync(&self, cancel: &CancelToken) -> Option<ClockOffset> {
        match self.probe(cancel).await {
            Ok(sample) => {
                let applied = {
                    let mut state = self.state.lock().expect("clock state mutex poisoned");
                    match *state {
                        ClockState::Synchronized(current) if current.sent_at > sample.sent_at => current,
                        _ => {
                            *state = ClockState::Synchronized(sample);
                            sample
                        }
                    }
                };
                if applied != sample {
                    tracing::debug!(
                        offset_ms = sample.offset.num_milliseconds(),
                        "Discarding clock sample older than the current one"
                    );
                    return Some(applied);
                }
                tracing::info!(
                    offset_ms = sample.offset.num_milliseconds(),
                    round_trip = ?sample.round_trip,
                    "Clock synchronized"
                );
                self.observer.on_clock_sync(sample.offset, sample.round_trip);
                Some(sample)
            }
            Err(FlowError::OperationCancelled(reason)) => {
                tracing::debug!(reason = %reason, "Clock sync cancelled");
                None
            }
            Err(error) => {
                tracing::warn!(
                    error = %error,
                    offset_ms = self.offset().num_milliseconds(),
                    "Clock sync failed; keeping last offset"
                );
                self.observer.on_clock_sync_failed(error.kind());
                None
            }
        }
    }

    async fn probe(&self, cancel: &CancelToken) -> FlowResult<ClockOffset> {
        let request = ApiRequest::head(self.config.probe_path.as_str());
        let sent = Instant::now();

        let response = cancel
            .run(with_deadline(
                self.config.probe_timeout(),
                self.dispatcher.dispatch(request),
            ))
            .await??;

        let round_trip = sent.elapsed();
        let measured_at = self.clock.now();

        let server_date = response.server_date.ok_or_else(|| {
            FlowError::ClockSyncFailed(format!(
                "probe response (status {}) has no Date header",
                response.status
            ))
        })?;

        let half_trip = chrono::Duration::from_std(round_trip / 2)
            .map_err(|e| FlowError::ClockSyncFailed(format!("round trip out of range: {}", e)))?;
        let offset = server_date + half_trip - measured_at;

        Ok(ClockOffset {
            offset,
            round_trip,
            measured_at,
            sent_at: sent,
        })
    }

    /// Resync every `resync_interval_secs` until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancelToken) {
        if !self.config.enabled {
            tracing::info!("Clock synchronization disabled");
            return;
        }

        tracing::info!(
            interval = self.config.resync_interval_secs,
            path = %self.config.probe_path,
            "Clock synchronizer starting"
        );

        let mut ticker = time::interval(Duration::from_secs(self.config.resync_interval_secs.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sync(&cancel).await;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Clock synchronizer received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::observability::metrics::testing::CountingObserver;
    use crate::transport::{dispatch_fn, ApiResponse};
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn local_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    /// Probe answers after `delay` with a Date `skew` ahead of the local start,
    /// or fails when `fail` is set.
    fn synchronizer(
        delay: Duration,
        skew: chrono::Duration,
        fail: Arc<AtomicBool>,
        observer: Arc<CountingObserver>,
    ) -> (ClockSynchronizer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(local_start()));
        let dispatcher = dispatch_fn(move |_request: ApiRequest| {
            let fail = fail.load(Ordering::SeqCst);
            async move {
                tokio::time::sleep(delay).await;
                if fail {
                    Err(FlowError::TransientRemoteFailure {
                        status: 0,
                        message: "connection refused".into(),
                        retry_after: None,
                    })
                } else {
                    Ok(ApiResponse::new(204, "").with_server_date(local_start() + skew))
                }
            }
        });
        let sync = ClockSynchronizer::with_clock(
            Arc::new(dispatcher),
            clock.clone(),
            ClockConfig::default(),
            observer,
        );
        (sync, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_offset_includes_half_round_trip() {
        let observer = Arc::new(CountingObserver::default());
        let (sync, clock) = synchronizer(
            Duration::from_millis(400),
            chrono::Duration::seconds(3),
            Arc::new(AtomicBool::new(false)),
            observer.clone(),
        );
        assert_eq!(sync.state(), ClockState::Unsynchronized);
        assert_eq!(sync.corrected_now(), local_start());

        let sample = sync.sync(&CancelToken::new()).await.unwrap();
        assert!(sample.round_trip >= Duration::from_millis(400));
        assert!(sample.round_trip < Duration::from_millis(405));
        let half_trip = chrono::Duration::from_std(sample.round_trip / 2).unwrap();
        assert_eq!(sample.offset, chrono::Duration::seconds(3) + half_trip);
        assert_eq!(sample.measured_at, local_start());
        assert!(sync.state().is_synchronized());
        assert_eq!(CountingObserver::get(&observer.syncs), 1);

        clock.advance(chrono::Duration::seconds(10));
        assert_eq!(
            sync.corrected_now(),
            local_start() + chrono::Duration::seconds(10) + sample.offset
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_keeps_last_offset() {
        let observer = Arc::new(CountingObserver::default());
        let fail = Arc::new(AtomicBool::new(false));
        let (sync, _clock) = synchronizer(
            Duration::from_millis(100),
            chrono::Duration::seconds(-2),
            fail.clone(),
            observer.clone(),
        );

        sync.sync(&CancelToken::new()).await.unwrap();
        let before = sync.corrected_now();
        let state = sync.state();

        fail.store(true, Ordering::SeqCst);
        assert!(sync.sync(&CancelToken::new()).await.is_none());

        assert_eq!(sync.corrected_now(), before);
        assert_eq!(sync.state(), state);
        assert_eq!(CountingObserver::get(&observer.sync_failures), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_before_first_sync_stays_unsynchronized() {
        let (sync, _clock) = synchronizer(
            Duration::ZERO,
            chrono::Duration::zero(),
            Arc::new(AtomicBool::new(true)),
            Arc::new(CountingObserver::default()),
        );
        assert!(sync.sync(&CancelToken::new()).await.is_none());
        assert_eq!(sync.state(), ClockState::Unsynchronized);
        assert_eq!(sync.corrected_now(), local_start());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_without_date_fails() {
        let observer = Arc::new(CountingObserver::default());
        let dispatcher = dispatch_fn(|_request: ApiRequest| async { Ok(ApiResponse::new(200, "")) });
        let sync = ClockSynchronizer::with_clock(
            Arc::new(dispatcher),
            Arc::new(ManualClock::new(local_start())),
            ClockConfig::default(),
            observer.clone(),
        );

        assert!(sync.sync(&CancelToken::new()).await.is_none());
        assert_eq!(CountingObserver::get(&observer.sync_failures), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_probe_times_out() {
        let observer = Arc::new(CountingObserver::default());
        let (sync, _clock) = synchronizer(
            Duration::from_secs(30),
            chrono::Duration::zero(),
            Arc::new(AtomicBool::new(false)),
            observer.clone(),
        );

        assert!(sync.sync(&CancelToken::new()).await.is_none());
        assert_eq!(CountingObserver::get(&observer.sync_failures), 1);
        assert!(!sync.state().is_synchronized());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resync_loop_replaces_offset_and_stops() {
        let observer = Arc::new(CountingObserver::default());
        let (sync, _clock) = synchronizer(
            Duration::from_millis(10),
            chrono::Duration::seconds(1),
            Arc::new(AtomicBool::new(false)),
            observer.clone(),
        );
        let sync = Arc::new(sync);
        let cancel = CancelToken::new();
        let handle = tokio::spawn(sync.clone().run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert_eq!(CountingObserver::get(&observer.syncs), 2);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_arriving_older_probe_is_discarded() {
        let observer = Arc::new(CountingObserver::default());
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let dispatcher = {
            let calls = calls.clone();
            dispatch_fn(move |_request: ApiRequest| {
                // First probe is slow and reports +10s; the second is quick and reports +20s.
                let (delay, skew) = match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => (Duration::from_secs(1), chrono::Duration::seconds(10)),
                    _ => (Duration::from_millis(100), chrono::Duration::seconds(20)),
                };
                async move {
                    tokio::time::sleep(delay).await;
                    Ok(ApiResponse::new(204, "").with_server_date(local_start() + skew))
                }
            })
        };
        let sync = ClockSynchronizer::with_clock(
            Arc::new(dispatcher),
            Arc::new(ManualClock::new(local_start())),
            ClockConfig::default(),
            observer.clone(),
        );
        let cancel = CancelToken::new();

        let (older, newer) = tokio::join!(sync.sync(&cancel), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sync.sync(&cancel).await
        });

        let newer = newer.unwrap();
        assert_eq!(older, Some(newer));
        assert!(newer.offset >= chrono::Duration::seconds(20));
        assert_eq!(sync.offset(), newer.offset);
        assert_eq!(CountingObserver::get(&observer.syncs), 1);
    }
}
