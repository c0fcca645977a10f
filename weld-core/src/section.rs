//! The section contract: the uniform interface every pipeline stage
//! implements, and the `PipelineSection` tree weld composes.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use futures::StreamExt;

use crate::channel::{Receiver, Sender};
use crate::error::Result;

/// A boxed, owned stream of items.
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// An async iterable of items handed to a section as its input. Some
/// sources (notably a pipeline channel) expose a close operation that the
/// substrate invokes once a section is done reading; others (an arbitrary
/// user-supplied stream) do not, and are simply dropped.
pub struct ItemStream<T> {
    stream: BoxStream<T>,
    closer: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> std::fmt::Debug for ItemStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemStream").finish()
    }
}

impl<T: Send + 'static> ItemStream<T> {
    /// Wraps a plain stream with no close capability.
    pub fn new(stream: impl Stream<Item = T> + Send + 'static) -> Self {
        ItemStream {
            stream: Box::pin(stream),
            closer: None,
        }
    }

    /// Wraps a stream together with a close callback, invoked at most once
    /// when the owning pump is done with this input.
    pub fn with_closer(
        stream: impl Stream<Item = T> + Send + 'static,
        closer: impl FnOnce() + Send + 'static,
    ) -> Self {
        ItemStream {
            stream: Box::pin(stream),
            closer: Some(Box::new(closer)),
        }
    }

    /// Advances the stream.
    pub async fn next(&mut self) -> Option<T> {
        self.stream.next().await
    }

    /// Invokes the close callback, if any. Idempotent — calling it twice
    /// is a no-op the second time.
    pub fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl<T: Send + 'static> From<Receiver<T>> for ItemStream<T> {
    fn from(receiver: Receiver<T>) -> Self {
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let closer_handle = receiver.clone();
        let stream = futures::stream::unfold(receiver, |receiver| async move {
            let item = receiver.lock().await.recv().await;
            item.map(|item| (item, receiver))
        });
        ItemStream::with_closer(stream, move || {
            if let Ok(mut guard) = closer_handle.try_lock() {
                guard.close();
            }
        })
    }
}

/// The output half a section writes into. Thin wrapper over a channel
/// sender; kept distinct so a section's interface doesn't leak channel
/// internals.
pub struct OutputSink<T> {
    sender: Sender<T>,
}

impl<T: Send + 'static> OutputSink<T> {
    pub fn new(sender: Sender<T>) -> Self {
        OutputSink { sender }
    }

    /// Sends one item downstream.
    pub async fn send(&self, item: T) -> Result<()> {
        self.sender.send(item).await
    }

    /// Closes the output early. `pump` always does this on a section's
    /// behalf at exit; a section only needs to call it to signal it will
    /// produce no more items while it continues running (rare).
    pub fn close(&self) {
        self.sender.close();
    }
}

/// A pipeline stage running on the primary async runtime.
///
/// `input`/`output` are borrowed, not consumed: `pump` retains ownership
/// so it can close both exactly once after `run` returns, regardless of
/// how (or whether) the section itself touched them.
#[async_trait]
pub trait Section<T: Send + 'static>: Send + Sync {
    /// Reads `input` (absent only for the first stage in a sequence) and
    /// writes to `output` until exhausted, then returns. Errors other
    /// than cancellation are fatal to the enclosing scope.
    async fn run(&self, input: Option<&mut ItemStream<T>>, output: &OutputSink<T>) -> Result<()>;
}

/// A pipeline stage whose body is synchronous and must run off the
/// primary runtime, on a dedicated worker thread. See `weld_bridge::thread`
/// for the adapter that turns this into a [`Section`].
pub trait ThreadSection<T: Send + 'static>: Send + Sync {
    /// Runs synchronously on a worker thread. `input` yields items one at
    /// a time (blocking); `output` is a blocking send callback.
    fn run(&self, input: Option<SyncItemIter<T>>, output: SyncOutput<T>) -> Result<()>;
}

/// A pipeline stage whose body is synchronous and must run in a separate
/// OS process. See `weld_bridge::process`.
pub trait ProcessSection<T>: Send + Sync
where
    T: Send + serde::Serialize + serde::de::DeserializeOwned + 'static,
{
    /// Runs synchronously inside the child process.
    fn run(&self, input: Option<SyncItemIter<T>>, output: SyncOutput<T>) -> Result<()>;
}

/// A pipeline stage whose body is async but bound to a distinct event
/// loop running on a daemon thread. See `weld_bridge::foreign_loop`.
#[async_trait]
pub trait ForeignLoopSection<T: Send + 'static>: Send + Sync {
    /// Runs on the foreign loop's own runtime.
    async fn run(&self, input: Option<&mut ItemStream<T>>, output: &OutputSink<T>) -> Result<()>;
}

/// A blocking iterator handed to [`ThreadSection`]/[`ProcessSection`]
/// bodies, bridging an async input stream across the thread or process
/// boundary one item at a time.
pub struct SyncItemIter<T> {
    recv: std::sync::mpsc::Receiver<T>,
}

impl<T> SyncItemIter<T> {
    pub fn new(recv: std::sync::mpsc::Receiver<T>) -> Self {
        SyncItemIter { recv }
    }
}

impl<T> Iterator for SyncItemIter<T> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        self.recv.recv().ok()
    }
}

/// A blocking send callback handed to [`ThreadSection`]/[`ProcessSection`]
/// bodies.
pub struct SyncOutput<T> {
    send: std::sync::mpsc::SyncSender<T>,
}

impl<T> SyncOutput<T> {
    pub fn new(send: std::sync::mpsc::SyncSender<T>) -> Self {
        SyncOutput { send }
    }

    /// Blocks the calling (worker) thread until the item is accepted.
    pub fn send(&self, item: T) -> Result<()> {
        self.send
            .send(item)
            .map_err(|_| crate::error::Error::BrokenResource)
    }
}

/// One node of the tree weld composes: either a ready-made stream (only
/// valid in head position), a single stage, or a nested sub-sequence.
pub enum PipelineSection<T: Send + 'static> {
    /// An async iterable supplying the initial items of a (sub-)sequence.
    Source(ItemStream<T>),
    /// A single stage, native or bridged — bridging is expressed entirely
    /// by which [`Section`] implementation is supplied, not by a variant
    /// here (see `weld_bridge`'s `ThreadBridge`/`ProcessBridge`/
    /// `ForeignLoopBridge` adapters).
    Stage(Arc<dyn Section<T>>),
    /// A nested sub-sequence, welded recursively.
    Tuple(Vec<PipelineSection<T>>),
}

impl<T: Send + 'static> PipelineSection<T> {
    /// Convenience constructor for a native stage.
    pub fn stage(section: impl Section<T> + 'static) -> Self {
        PipelineSection::Stage(Arc::new(section))
    }

    /// Convenience constructor for a source iterable.
    pub fn source(stream: impl Stream<Item = T> + Send + 'static) -> Self {
        PipelineSection::Source(ItemStream::new(stream))
    }
}
