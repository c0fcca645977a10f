//! The weld algorithm: turns a [`PipelineSection`] tree into a single
//! async iterable, spawning one pump worker per stage into a [`Scope`].

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::channel::{self, Sender};
use crate::error::{Error, Result};
use crate::scope::Scope;
use crate::section::{ItemStream, OutputSink, PipelineSection, Section};

/// Composes `sections` into one output stream, spawning a pump for every
/// [`PipelineSection::Stage`] into `scope`.
///
/// `sections` must be non-empty, and at most one
/// [`PipelineSection::Source`] may appear, and only in the first
/// position — anywhere else is an [`Error::InvalidPipelineShape`].
pub fn weld<T: Send + 'static>(
    scope: &Scope,
    sections: Vec<PipelineSection<T>>,
) -> Result<ItemStream<T>> {
    if sections.is_empty() {
        return Err(Error::InvalidPipelineShape(
            "a pipeline sequence must contain at least one section".into(),
        ));
    }

    let mut current: Option<ItemStream<T>> = None;

    for section in sections {
        match section {
            PipelineSection::Source(stream) => {
                if current.is_some() {
                    return Err(Error::InvalidPipelineShape(
                        "an async iterable may only appear as the first element of a sequence"
                            .into(),
                    ));
                }
                current = Some(stream);
            }
            PipelineSection::Stage(stage) => {
                let input = current.take();
                let (tx, rx) = channel::channel(0);
                spawn_pump(scope, stage, input, tx);
                current = Some(ItemStream::from(rx));
            }
            PipelineSection::Tuple(mut nested) => {
                if let Some(input) = current.take() {
                    nested.insert(0, PipelineSection::Source(input));
                }
                current = Some(weld(scope, nested)?);
            }
        }
    }

    Ok(current.expect("loop over a non-empty Vec always assigns `current`"))
}

fn spawn_pump<T: Send + 'static>(
    scope: &Scope,
    stage: Arc<dyn Section<T>>,
    input: Option<ItemStream<T>>,
    output: Sender<T>,
) {
    let token = scope.cancellation_token();
    scope.spawn(pump(stage, input, output, token));
}

/// The universal per-section worker. Runs `stage`, swallows
/// [`Error::BrokenResource`] (the downstream tap or section closed), and
/// unconditionally closes `input` (if present) then `output` before
/// returning.
#[instrument(skip_all)]
pub(crate) async fn pump<T: Send + 'static>(
    stage: Arc<dyn Section<T>>,
    mut input: Option<ItemStream<T>>,
    output: Sender<T>,
    token: CancellationToken,
) -> std::result::Result<(), Error> {
    let sink = OutputSink::new(output);

    let result = tokio::select! {
        biased;
        _ = token.cancelled() => Ok(()),
        result = stage.run(input.as_mut(), &sink) => result,
    };

    if let Some(input) = input.as_mut() {
        input.close();
    }
    sink.close();

    match result {
        Ok(()) => Ok(()),
        Err(Error::BrokenResource) => {
            warn!("section's output closed upstream; treating as normal shutdown");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Double;

    #[async_trait]
    impl Section<i32> for Double {
        async fn run(
            &self,
            input: Option<&mut ItemStream<i32>>,
            output: &OutputSink<i32>,
        ) -> Result<()> {
            let input = input.expect("Double requires input");
            while let Some(item) = input.next().await {
                output.send(item * 2).await?;
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn single_stage_doubles_items() {
        let scope = Scope::new();
        let source = PipelineSection::source(stream::iter(vec![1, 2, 3]));
        let stage = PipelineSection::stage(Double);
        let mut out = weld(&scope, vec![source, stage]).unwrap();
        let mut items = Vec::new();
        while let Some(item) = out.next().await {
            items.push(item);
        }
        assert_eq!(items, vec![2, 4, 6]);
        scope.join().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_source_not_in_head_position() {
        let scope = Scope::new();
        let a = PipelineSection::<i32>::source(stream::iter(vec![1]));
        let b = PipelineSection::<i32>::source(stream::iter(vec![2]));
        let err = weld(&scope, vec![a, b]).unwrap_err();
        assert!(matches!(err, Error::InvalidPipelineShape(_)));
    }

    #[tokio::test]
    async fn pump_closes_input_on_normal_exit() {
        let scope = Scope::new();
        let closed = Arc::new(AtomicBool::new(false));
        let closed_for_closer = closed.clone();
        let source_stream = ItemStream::with_closer(stream::iter(vec![1, 2]), move || {
            closed_for_closer.store(true, Ordering::SeqCst);
        });
        let source = PipelineSection::Source(source_stream);
        let stage = PipelineSection::stage(Double);
        let mut out = weld(&scope, vec![source, stage]).unwrap();
        while out.next().await.is_some() {}
        scope.join().await.unwrap();
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn nested_tuple_welds_associatively() {
        let scope_a = Scope::new();
        let a = PipelineSection::source(stream::iter(vec![1, 2, 3]));
        let flat = vec![a, PipelineSection::stage(Double), PipelineSection::stage(Double)];
        let mut out_a = weld(&scope_a, flat).unwrap();
        let mut flat_items = Vec::new();
        while let Some(i) = out_a.next().await {
            flat_items.push(i);
        }
        scope_a.join().await.unwrap();

        let scope_b = Scope::new();
        let b = PipelineSection::source(stream::iter(vec![1, 2, 3]));
        let nested = vec![
            b,
            PipelineSection::Tuple(vec![
                PipelineSection::stage(Double),
                PipelineSection::stage(Double),
            ]),
        ];
        let mut out_b = weld(&scope_b, nested).unwrap();
        let mut nested_items = Vec::new();
        while let Some(i) = out_b.next().await {
            nested_items.push(i);
        }
        scope_b.join().await.unwrap();

        assert_eq!(flat_items, nested_items);
    }
}
