//! Per-consumer output attachment: a channel plus timeout+retry send
//! semantics and closed-state tracking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::channel::Sender;
use crate::error::{Error, Result};
use crate::metrics::PipelineMetrics;

/// A pipeline's fan-out attachment to one consumer. Not constructed
/// directly by client code — see [`crate::pipeline::Pipeline::tap`].
pub struct Tap<T: Send + 'static> {
    sender: Sender<T>,
    timeout: Option<Duration>,
    retries: u32,
    closed: AtomicBool,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl<T: Clone + Send + 'static> Tap<T> {
    pub(crate) fn new(
        sender: Sender<T>,
        timeout: Option<Duration>,
        retries: u32,
        metrics: Option<Arc<PipelineMetrics>>,
    ) -> Self {
        Tap {
            sender,
            timeout,
            retries,
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    /// True once a send has observed the consumer side closed. The
    /// pipeline's output driver prunes closed taps from its fan-out set
    /// on its next pass.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Closes the underlying channel, e.g. because the pipeline itself is
    /// shutting down and every tap must be told so.
    pub fn close(&self) {
        self.sender.close();
    }

    /// Attempts to deliver `item`, retrying up to `retries` additional
    /// times after a per-attempt timeout elapses. Returns `Ok(())` both on
    /// success and when the consumer turns out to be gone (the tap is
    /// marked closed instead); returns [`Error::BusyResource`] only once
    /// every attempt has timed out.
    pub async fn send(&self, item: T) -> Result<()> {
        for _attempt in 0..=self.retries {
            let attempt_result = match self.timeout {
                Some(duration) => match tokio::time::timeout(duration, self.sender.send(item.clone())).await {
                    Ok(result) => result,
                    Err(_elapsed) => {
                        if let Some(metrics) = &self.metrics {
                            metrics.record_tap_timeout();
                        }
                        tokio::task::yield_now().await;
                        continue;
                    }
                },
                None => self.sender.send(item.clone()).await,
            };

            return match attempt_result {
                Ok(()) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_tap_send();
                    }
                    Ok(())
                }
                Err(Error::BrokenResource) => {
                    self.closed.store(true, Ordering::SeqCst);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_tap_drop();
                    }
                    Ok(())
                }
                Err(err) => Err(err),
            };
        }
        warn!(
            attempts = self.retries + 1,
            "tap exhausted retries without delivering item"
        );
        Err(Error::BusyResource {
            attempts: self.retries + 1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel;

    #[tokio::test]
    async fn send_succeeds_with_unbounded_timeout() {
        let (tx, mut rx) = channel::channel::<u32>(0);
        let tap = Tap::new(tx, None, 0, None);
        let send = tokio::spawn(async move { tap.send(5).await });
        assert_eq!(rx.recv().await, Some(5));
        send.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn send_reports_closed_when_receiver_gone() {
        let (tx, rx) = channel::channel::<u32>(0);
        drop(rx);
        let tap = Tap::new(tx, None, 0, None);
        tap.send(1).await.unwrap();
        assert!(tap.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn send_raises_busy_resource_after_exhausting_retries() {
        let (tx, _rx) = channel::channel::<u32>(0);
        let tap = Tap::new(tx, Some(Duration::from_millis(10)), 2, None);
        let err = tap.send(1).await.unwrap_err();
        assert!(matches!(err, Error::BusyResource { attempts: 3 }));
    }
}
