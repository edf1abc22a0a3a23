//! Global rate gate.
//!
//! # Responsibilities
//! - Bound aggregate request rate for the whole client to N per second
//! - Admit waiters strictly oldest-first, one every `1000/N` ms
//!
//! # Design Decisions
//! - A single emitter task owns the queue; waiters park on a oneshot, not a thread
//! - A waiter that cancels before its turn is skipped without consuming a slot
//! - Disposal fails every queued waiter with `GateClosed`

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::error::{FlowError, FlowResult};
use crate::lifecycle::cancel::{CancelReason, CancelToken};
use crate::observability::metrics::{GateKind, Observer};

/// Proof that the global gate admitted one request. Consumed by use.
#[derive(Debug)]
#[must_use = "a permit is only meaningful if the request is sent"]
pub struct GlobalPermit {
    granted_at: Instant,
    waited: Duration,
}

impl GlobalPermit {
    pub fn granted_at(&self) -> Instant {
        self.granted_at
    }

    pub fn waited(&self) -> Duration {
        self.waited
    }
}

struct Waiter {
    grant: oneshot::Sender<Instant>,
}

/// Cooperative FIFO limiter shared by every request of a client.
pub struct GlobalRateGate {
    queue: mpsc::UnboundedSender<Waiter>,
    interval: Duration,
    stop: CancelToken,
    observer: Arc<dyn Observer>,
}

impl GlobalRateGate {
    /// Spawn the emitter. Must be called from within a Tokio runtime.
    ///
    /// The gate is disposed when `shutdown` fires or the gate is dropped.
    pub fn new(
        requests_per_second: u32,
        shutdown: &CancelToken,
        observer: Arc<dyn Observer>,
    ) -> FlowResult<Self> {
        if requests_per_second == 0 {
            return Err(FlowError::InvalidConfig(
                "global gate requires at least one request per second".to_string(),
            ));
        }

        let interval = Duration::from_secs_f64(1.0 / f64::from(requests_per_second));
        let (queue, rx) = mpsc::unbounded_channel();
        let stop = shutdown.child();

        tokio::spawn(run_emitter(rx, interval, stop.clone()));
        tracing::debug!(requests_per_second, interval = ?interval, "Global rate gate started");

        Ok(Self {
            queue,
            interval,
            stop,
            observer,
        })
    }

    /// Wait for the next slot.
    pub async fn acquire(&self, cancel: &CancelToken) -> FlowResult<GlobalPermit> {
        let enqueued = Instant::now();
        let (grant, granted) = oneshot::channel();
        self.queue
            .send(Waiter { grant })
            .map_err(|_| FlowError::GateClosed)?;

        // Dropping `granted` on cancel is how the emitter learns to skip us.
        match cancel.run(granted).await? {
            Ok(granted_at) => {
                let waited = granted_at.saturating_duration_since(enqueued);
                tracing::trace!(waited = ?waited, "Global gate admitted request");
                self.observer.on_gate_wait(GateKind::Global, waited);
                Ok(GlobalPermit { granted_at, waited })
            }
            Err(_) => Err(FlowError::GateClosed),
        }
    }

    /// Spacing between admissions.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Release every waiter with `GateClosed` and refuse new ones.
    pub fn dispose(&self) {
        self.stop.cancel_with(CancelReason::Shutdown);
    }

    pub fn is_disposed(&self) -> bool {
        self.stop.is_cancelled() || self.queue.is_closed()
    }
}

impl Drop for GlobalRateGate {
    fn drop(&mut self) {
        self.stop.cancel_with(CancelReason::Shutdown);
    }
}

async fn run_emitter(mut rx: mpsc::UnboundedReceiver<Waiter>, interval: Duration, stop: CancelToken) {
    let mut next_slot = Instant::now();

    loop {
        let waiter = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            waiter = rx.recv() => match waiter {
                Some(waiter) => waiter,
                None => break,
            },
        };

        if waiter.grant.is_closed() {
            continue;
        }

        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = sleep_until(next_slot) => {}
        }

        let now = Instant::now();
        if waiter.grant.send(now).is_ok() {
            next_slot = now + interval;
        }
    }

    rx.close();
    let mut released = 0usize;
    while rx.try_recv().is_ok() {
        released += 1;
    }
    tracing::debug!(released, "Global rate gate disposed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::metrics::testing::CountingObserver;
    use crate::observability::NoopObserver;

    fn gate(rps: u32, shutdown: &CancelToken) -> Arc<GlobalRateGate> {
        Arc::new(GlobalRateGate::new(rps, shutdown, Arc::new(NoopObserver)).unwrap())
    }

    #[tokio::test]
    async fn test_zero_rate_is_rejected() {
        let result = GlobalRateGate::new(0, &CancelToken::new(), Arc::new(NoopObserver));
        assert!(matches!(result, Err(FlowError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_release_one_per_interval() {
        let gate = gate(1, &CancelToken::new());
        let origin = Instant::now();
        let mut handles = Vec::new();

        for name in ["A", "B", "C"] {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                let permit = gate.acquire(&CancelToken::new()).await.unwrap();
                (name, permit.granted_at() - origin)
            }));
            // Make arrival order unambiguous.
            tokio::task::yield_now().await;
        }

        let mut released = Vec::new();
        for handle in handles {
            released.push(handle.await.unwrap());
        }
        released.sort_by_key(|(_, at)| *at);

        let names: Vec<_> = released.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        for (i, (_, at)) in released.iter().enumerate() {
            let expected = Duration::from_secs(i as u64);
            assert!(*at >= expected && *at < expected + Duration::from_millis(50), "{:?}", at);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_waiter_does_not_consume_slot() {
        let gate = gate(1, &CancelToken::new());
        let origin = Instant::now();

        // First caller takes the immediate slot.
        let _first = gate.acquire(&CancelToken::new()).await.unwrap();

        let cancel = CancelToken::new();
        let doomed = {
            let gate = gate.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.acquire(&cancel).await })
        };
        tokio::task::yield_now().await;
        let survivor = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(&CancelToken::new()).await })
        };
        tokio::task::yield_now().await;

        cancel.cancel();
        let doomed = doomed.await.unwrap();
        assert_eq!(doomed.unwrap_err(), FlowError::OperationCancelled(CancelReason::Explicit));

        let permit = survivor.await.unwrap().unwrap();
        let at = permit.granted_at() - origin;
        assert!(at >= Duration::from_secs(1) && at < Duration::from_millis(1_050), "{:?}", at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_releases_waiters_with_error() {
        let gate = gate(1, &CancelToken::new());
        let _first = gate.acquire(&CancelToken::new()).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(&CancelToken::new()).await })
        };
        tokio::task::yield_now().await;

        gate.dispose();
        assert_eq!(waiter.await.unwrap().unwrap_err(), FlowError::GateClosed);

        // Give the emitter a chance to close the queue.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(gate.acquire(&CancelToken::new()).await.unwrap_err(), FlowError::GateClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_observed() {
        let observer = Arc::new(CountingObserver::default());
        let gate = GlobalRateGate::new(10, &CancelToken::new(), observer.clone()).unwrap();
        for _ in 0..3 {
            let _ = gate.acquire(&CancelToken::new()).await.unwrap();
        }
        assert_eq!(CountingObserver::get(&observer.gate_waits), 3);
    }
}
