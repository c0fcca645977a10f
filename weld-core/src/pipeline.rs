//! The public façade: a scoped, lazily-started composition of sections
//! with multi-consumer fan-out and dynamic extension.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{info, instrument};

use crate::channel::{self, Receiver};
use crate::config::TapConfig;
use crate::error::{Error, Result};
use crate::metrics::PipelineMetrics;
use crate::scope::Scope;
use crate::section::{ItemStream, PipelineSection};
use crate::tap::Tap;
use crate::weld::weld;

/// A scoped, lazily-started pipeline. Cheap to clone — clones share the
/// same scope, enabled flag, and tap registry, mirroring how an
/// [`crate::scope::Scope`] handle is shared across workers.
#[derive(Clone)]
pub struct Pipeline<T: Send + 'static> {
    scope: Scope,
    enabled: watch::Sender<bool>,
    tap_tx: mpsc::UnboundedSender<Arc<Tap<T>>>,
    metrics: Arc<PipelineMetrics>,
}

/// Returned by [`Pipeline::create`]; owns the scope until [`PipelineGuard::scoped`]
/// runs its body and tears the scope down.
pub struct PipelineGuard<T: Send + 'static> {
    pipeline: Pipeline<T>,
}

impl<T: Clone + Send + 'static> Pipeline<T> {
    /// Builds a new pipeline around `sections`, deferring any work until
    /// the first tap with `start: true` is registered.
    pub fn create(sections: Vec<PipelineSection<T>>) -> PipelineGuard<T> {
        let scope = Scope::new();
        let (enabled, enabled_rx) = watch::channel(false);
        let (tap_tx, tap_rx) = mpsc::unbounded_channel();
        let metrics = Arc::new(PipelineMetrics::new());

        let pipeline = Pipeline {
            scope: scope.clone(),
            enabled: enabled.clone(),
            tap_tx,
            metrics: metrics.clone(),
        };

        scope.spawn(output_driver(scope.clone(), enabled_rx, sections, tap_rx, metrics));
        PipelineGuard { pipeline }
    }

    /// Registers a new output attachment. Multiple taps may be open at
    /// once; each receives its own copy of every item produced after it
    /// was registered.
    pub fn tap(&self, config: TapConfig) -> Receiver<T> {
        let (tx, rx) = channel::channel(config.max_buffer_size);
        let tap = Arc::new(Tap::new(
            tx,
            config.timeout,
            config.retries,
            Some(self.metrics.clone()),
        ));
        // The output driver hasn't necessarily been polled yet; it drains
        // this channel on its own schedule, so a dropped send (driver
        // already torn down) is not an error here.
        let _ = self.tap_tx.send(tap);
        if config.start {
            // `send` only errors if every receiver (every output_driver's
            // subscription) has been dropped, which just means there is
            // nothing left to start.
            let _ = self.enabled.send(true);
        }
        rx
    }

    /// Extends this pipeline with additional sections, fed by a new tap
    /// of this pipeline. The extension shares this pipeline's scope (and
    /// therefore its cancellation) and enabled flag.
    pub fn extend(&self, sections: Vec<PipelineSection<T>>, start: bool) -> Pipeline<T> {
        let input = self.tap(TapConfig::default().with_start(start));
        let mut full_sections = Vec::with_capacity(sections.len() + 1);
        full_sections.push(PipelineSection::Source(ItemStream::from(input)));
        full_sections.extend(sections);

        let (tap_tx, tap_rx) = mpsc::unbounded_channel();
        let child = Pipeline {
            scope: self.scope.clone(),
            enabled: self.enabled.clone(),
            tap_tx,
            metrics: self.metrics.clone(),
        };

        // Each driver subscribes independently and checks the already-current
        // value before waiting, so a late subscriber that joins after the
        // flag flipped true still starts — a bare `Notify` permit can only
        // wake one waiter and would starve whichever driver registers second.
        self.scope.spawn(output_driver(
            self.scope.clone(),
            self.enabled.subscribe(),
            full_sections,
            tap_rx,
            self.metrics.clone(),
        ));
        child
    }

    /// A snapshot of this pipeline's activity counters.
    pub fn metrics(&self) -> crate::metrics::PipelineMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The scope backing this pipeline, mainly useful for tests that want
    /// to assert on cancellation/join behavior directly.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }
}

impl<T: Clone + Send + 'static> PipelineGuard<T> {
    /// Runs `body` with a handle to the pipeline, then cancels the scope
    /// and waits for every worker (pumps, tap sends, extensions) to wind
    /// down before returning. This is the `async with Pipeline.create(...)`
    /// of the original design, expressed as an explicit scoping call since
    /// the language has no equivalent block form.
    pub async fn scoped<F, Fut, R>(self, body: F) -> Result<R>
    where
        F: FnOnce(Pipeline<T>) -> Fut,
        Fut: Future<Output = R>,
    {
        let result = body(self.pipeline.clone()).await;
        self.pipeline.scope.cancel();
        self.pipeline.scope.join().await?;
        Ok(result)
    }
}

#[instrument(skip_all)]
async fn output_driver<T: Clone + Send + 'static>(
    scope: Scope,
    mut enabled: watch::Receiver<bool>,
    sections: Vec<PipelineSection<T>>,
    mut tap_rx: mpsc::UnboundedReceiver<Arc<Tap<T>>>,
    metrics: Arc<PipelineMetrics>,
) -> std::result::Result<(), Error> {
    // `wait_for` checks the current value before registering interest, so
    // a driver that subscribes after the flag already flipped true (an
    // `extend()`-ed child welded after the parent already started) still
    // observes it instead of waiting on a permit nothing will ever send.
    if enabled.wait_for(|started| *started).await.is_err() {
        // Every `Pipeline` handle (and its `enabled` sender) was dropped
        // before any tap requested a start; there is nothing to weld.
        return Ok(());
    }
    info!("pipeline enabled, welding sections");

    let mut out = weld(&scope, sections)?;
    let mut taps: Vec<Arc<Tap<T>>> = Vec::new();

    while let Some(item) = out.next().await {
        while let Ok(tap) = tap_rx.try_recv() {
            taps.push(tap);
        }
        taps.retain(|tap| !tap.is_closed());
        if taps.is_empty() {
            info!("no taps remain, stopping output driver");
            break;
        }
        metrics.record_item_emitted();
        for tap in &taps {
            let tap = tap.clone();
            let item = item.clone();
            scope.spawn(async move { tap.send(item).await });
        }
    }

    // Stopping here means either the welded chain ran out of items on its
    // own (closing `out` is then a no-op) or every tap went away while
    // items remained; in the latter case this is the only thing left to
    // close `out`'s underlying resource, so the closure has to happen
    // explicitly rather than riding on `out`'s `Drop`.
    out.close();

    while let Ok(tap) = tap_rx.try_recv() {
        taps.push(tap);
    }
    for tap in &taps {
        tap.close();
    }
    Ok(())
}
