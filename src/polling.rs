//! Polling loop.
//!
//! A [`PollingProcessor`] prepares work for an iteration and processes it;
//! [`run_polling_loop`] drives it until the shutdown token fires, sleeping
//! `poll_interval` plus random jitter between iterations.

use async_trait::async_trait;
use rand::Rng;
use std::convert::Infallible;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::emit;
use crate::metrics::events::CycleCompleted;
use crate::pipeline::Forwarder;

/// Result of a single iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationResult {
    /// At least one item was processed.
    ProcessedItems,
    /// Nothing new was found.
    NoItems,
    /// Shutdown was requested while processing.
    Shutdown,
}

/// A processor driven by [`run_polling_loop`].
#[async_trait]
pub trait PollingProcessor {
    /// State prepared for one iteration.
    type State: Send;
    type Error: std::error::Error + Send;

    /// Prepare an iteration. `None` means there is nothing to do.
    async fn prepare(&mut self, cold_start: bool) -> Result<Option<Self::State>, Self::Error>;

    /// Process a prepared iteration.
    ///
    /// Implementations check the shutdown token themselves; the loop never
    /// interrupts an iteration in progress.
    async fn process(&mut self, state: Self::State) -> Result<IterationResult, Self::Error>;
}

/// Run `processor` until `shutdown` is cancelled.
///
/// `poll_jitter_secs` adds 0..N seconds to every sleep so that replicas do
/// not poll in lockstep.
pub async fn run_polling_loop<P: PollingProcessor>(
    processor: &mut P,
    poll_interval: Duration,
    poll_jitter_secs: u64,
    shutdown: CancellationToken,
) -> Result<(), P::Error> {
    let mut first_iteration = true;

    loop {
        if shutdown.is_cancelled() {
            info!("Shutdown requested before next cycle");
            break;
        }

        let iteration_start = Instant::now();
        let cold_start = std::mem::replace(&mut first_iteration, false);

        let result = match processor.prepare(cold_start).await? {
            Some(state) => processor.process(state).await?,
            None => IterationResult::NoItems,
        };

        emit!(CycleCompleted {
            duration: iteration_start.elapsed(),
        });

        match result {
            IterationResult::Shutdown => {
                info!("Shutdown requested during cycle");
                break;
            }
            IterationResult::NoItems => {
                debug!(
                    "No new objects, waiting {}s before next poll",
                    poll_interval.as_secs()
                );
            }
            IterationResult::ProcessedItems => {
                debug!(
                    "Cycle complete, waiting {}s before next poll",
                    poll_interval.as_secs()
                );
            }
        }

        let sleep_duration = poll_interval + random_jitter(poll_jitter_secs);
        if shutdown
            .run_until_cancelled(tokio::time::sleep(sleep_duration))
            .await
            .is_none()
        {
            info!("Shutdown requested during poll wait");
            break;
        }
    }

    Ok(())
}

/// Random duration in `0..max_secs` seconds, millisecond resolution.
pub fn random_jitter(max_secs: u64) -> Duration {
    if max_secs > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_secs * 1000))
    } else {
        Duration::ZERO
    }
}

#[async_trait]
impl PollingProcessor for Forwarder {
    type State = ();
    type Error = Infallible;

    async fn prepare(&mut self, cold_start: bool) -> Result<Option<()>, Infallible> {
        if cold_start {
            info!(containers = self.items().len(), "Starting first poll cycle");
        }
        Ok((!self.items().is_empty()).then_some(()))
    }

    async fn process(&mut self, _state: ()) -> Result<IterationResult, Infallible> {
        let report = self.run_cycle().await;

        if self.shutdown().is_cancelled() {
            Ok(IterationResult::Shutdown)
        } else if report.did_work() {
            Ok(IterationResult::ProcessedItems)
        } else {
            Ok(IterationResult::NoItems)
        }
    }
}

/// Run the forwarder's poll cycles until shutdown.
pub async fn run_forwarder(
    forwarder: &mut Forwarder,
    poll_interval: Duration,
    poll_jitter_secs: u64,
) {
    let shutdown = forwarder.shutdown().clone();
    let Ok(()) = run_polling_loop(forwarder, poll_interval, poll_jitter_secs, shutdown).await;
    info!(containers = forwarder.items().len(), "Forwarder drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProcessor {
        prepared: Arc<AtomicUsize>,
        processed: Arc<AtomicUsize>,
        shutdown: CancellationToken,
        stop_after: usize,
    }

    #[async_trait]
    impl PollingProcessor for CountingProcessor {
        type State = usize;
        type Error = Infallible;

        async fn prepare(&mut self, _cold_start: bool) -> Result<Option<usize>, Infallible> {
            Ok(Some(self.prepared.fetch_add(1, Ordering::SeqCst)))
        }

        async fn process(&mut self, _state: usize) -> Result<IterationResult, Infallible> {
            let n = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.stop_after {
                self.shutdown.cancel();
            }
            Ok(IterationResult::ProcessedItems)
        }
    }

    #[test]
    fn test_random_jitter_zero() {
        assert_eq!(random_jitter(0), Duration::ZERO);
    }

    #[test]
    fn test_random_jitter_within_bounds() {
        for _ in 0..100 {
            assert!(random_jitter(10) < Duration::from_secs(10));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_runs_until_cancelled() {
        let shutdown = CancellationToken::new();
        let processed = Arc::new(AtomicUsize::new(0));
        let mut processor = CountingProcessor {
            prepared: Arc::new(AtomicUsize::new(0)),
            processed: processed.clone(),
            shutdown: shutdown.clone(),
            stop_after: 3,
        };

        run_polling_loop(&mut processor, Duration::from_secs(60), 0, shutdown)
            .await
            .unwrap();

        // The third cycle cancels; the sleep after it is cut short.
        assert_eq!(processed.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_loop_exits_immediately_when_already_cancelled() {
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let prepared = Arc::new(AtomicUsize::new(0));
        let mut processor = CountingProcessor {
            prepared: prepared.clone(),
            processed: Arc::new(AtomicUsize::new(0)),
            shutdown: shutdown.clone(),
            stop_after: 1,
        };

        run_polling_loop(&mut processor, Duration::from_secs(60), 0, shutdown)
            .await
            .unwrap();
        assert_eq!(prepared.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_sleep() {
        let shutdown = CancellationToken::new();
        let processed = Arc::new(AtomicUsize::new(0));
        let mut processor = CountingProcessor {
            prepared: Arc::new(AtomicUsize::new(0)),
            processed: processed.clone(),
            shutdown: shutdown.clone(),
            stop_after: usize::MAX,
        };

        let canceller = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(90)).await;
                shutdown.cancel();
            })
        };

        run_polling_loop(&mut processor, Duration::from_secs(60), 0, shutdown)
            .await
            .unwrap();
        canceller.await.unwrap();

        // Cycles at t=0 and t=60; cancelled while sleeping towards t=120.
        assert_eq!(processed.load(Ordering::SeqCst), 2);
    }
}
