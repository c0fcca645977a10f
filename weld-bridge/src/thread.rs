//! Background-thread bridge: runs a synchronous [`ThreadSection`] on a
//! dedicated worker thread, bridging its blocking input/output to the
//! primary runtime's async channels.
//!
//! Grounded in the same shape as `remotemedia_runtime`'s process/thread
//! bridges — blocking work lives behind `spawn_blocking`, so the pump's
//! own `.await` is what joins the worker.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use weld_core::section::{ItemStream, OutputSink, Section, SyncItemIter, SyncOutput, ThreadSection};
use weld_core::{Error, Result};

/// Tuning for the sync channel pair a [`ThreadBridge`] forwards items
/// across.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadBridgeConfig {
    /// Buffer size of the std-thread-facing channel pair. `0` (the
    /// default) is a rendezvous, matching the primary runtime's own
    /// default channel capacity.
    pub channel_capacity: usize,
}

impl Default for ThreadBridgeConfig {
    fn default() -> Self {
        ThreadBridgeConfig { channel_capacity: 0 }
    }
}

impl ThreadBridgeConfig {
    pub fn with_channel_capacity(mut self, channel_capacity: usize) -> Self {
        self.channel_capacity = channel_capacity;
        self
    }
}

/// Adapts a [`ThreadSection`] into an ordinary [`Section`] by running it
/// on a worker thread and forwarding items across the boundary one at a
/// time, preserving the rendezvous backpressure of a capacity-0 channel.
pub struct ThreadBridge<T: Send + 'static> {
    section: Arc<dyn ThreadSection<T>>,
    config: ThreadBridgeConfig,
}

impl<T: Send + 'static> ThreadBridge<T> {
    /// Wraps `section` so it can be used anywhere a native [`Section`] is
    /// expected.
    pub fn new(section: impl ThreadSection<T> + 'static) -> Self {
        ThreadBridge {
            section: Arc::new(section),
            config: ThreadBridgeConfig::default(),
        }
    }

    /// Overrides the default channel tuning.
    pub fn with_config(mut self, config: ThreadBridgeConfig) -> Self {
        self.config = config;
        self
    }
}

#[async_trait]
impl<T: Send + 'static> Section<T> for ThreadBridge<T> {
    async fn run(&self, input: Option<&mut ItemStream<T>>, output: &OutputSink<T>) -> Result<()> {
        let (sync_in_tx, sync_in_rx) =
            std::sync::mpsc::sync_channel::<T>(self.config.channel_capacity);
        let (sync_out_tx, sync_out_rx) =
            std::sync::mpsc::sync_channel::<T>(self.config.channel_capacity);

        let section = self.section.clone();
        let has_input = input.is_some();
        let worker = tokio::task::spawn_blocking(move || {
            let sync_input = has_input.then(|| SyncItemIter::new(sync_in_rx));
            let sync_output = SyncOutput::new(sync_out_tx);
            section.run(sync_input, sync_output)
        });

        // Owns `sync_in_tx`: once the block finishes (input exhausted, or
        // there was no input to begin with) the sender drops, so the
        // worker's blocking `recv` observes disconnection rather than
        // hanging forever.
        let forward_input = async move {
            let sync_in_tx = sync_in_tx;
            if let Some(input) = input {
                loop {
                    let Some(item) = input.next().await else {
                        break;
                    };
                    let tx = sync_in_tx.clone();
                    let accepted = tokio::task::spawn_blocking(move || tx.send(item))
                        .await
                        .map(|result| result.is_ok())
                        .unwrap_or(false);
                    if !accepted {
                        break;
                    }
                }
            }
        };

        let forward_output = async {
            let mut rx = sync_out_rx;
            loop {
                let (returned_rx, item) = tokio::task::spawn_blocking(move || {
                    let item = rx.recv();
                    (rx, item)
                })
                .await
                .map_err(Error::Join)?;
                rx = returned_rx;
                match item {
                    Ok(item) => {
                        if output.send(item).await.is_err() {
                            break;
                        }
                    }
                    Err(_disconnected) => break,
                }
            }
            Ok::<(), Error>(())
        };

        let (_, output_result, worker_result) =
            tokio::join!(forward_input, forward_output, worker);
        output_result?;
        worker_result.map_err(Error::Join)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use weld_core::scope::Scope;
    use weld_core::section::PipelineSection;
    use weld_core::weld::weld;

    struct UppercaseOnThread;

    impl ThreadSection<String> for UppercaseOnThread {
        fn run(
            &self,
            input: Option<weld_core::section::SyncItemIter<String>>,
            output: weld_core::section::SyncOutput<String>,
        ) -> Result<()> {
            for item in input.expect("requires input") {
                output.send(item.to_uppercase())?;
            }
            Ok(())
        }
    }

    #[test]
    fn config_default_is_rendezvous() {
        let config = ThreadBridgeConfig::default();
        assert_eq!(config.channel_capacity, 0);
        let widened = config.with_channel_capacity(8);
        assert_eq!(widened.channel_capacity, 8);
    }

    #[tokio::test]
    async fn thread_bridge_runs_synchronous_section() {
        let scope = Scope::new();
        let source = PipelineSection::source(stream::iter(vec![
            "ab".to_string(),
            "cd".to_string(),
        ]));
        let stage = PipelineSection::stage(ThreadBridge::new(UppercaseOnThread));
        let mut out = weld(&scope, vec![source, stage]).unwrap();
        let mut items = Vec::new();
        while let Some(item) = out.next().await {
            items.push(item);
        }
        scope.join().await.unwrap();
        assert_eq!(items, vec!["AB".to_string(), "CD".to_string()]);
    }
}
