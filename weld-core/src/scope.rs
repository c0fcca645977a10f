//! Structured concurrency: a [`Scope`] groups the worker tasks of a
//! pipeline (and its extensions) so that they cancel together and the
//! first non-cancellation failure is the one that surfaces.

use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// A handle to a running scope, cloneable and shareable across the
/// pipeline workers spawned into it.
#[derive(Clone)]
pub struct Scope {
    handles: Arc<Mutex<Vec<JoinHandle<std::result::Result<(), Error>>>>>,
    first_error: Arc<Mutex<Option<Error>>>,
    token: CancellationToken,
}

impl Scope {
    /// Opens a new, empty scope.
    pub fn new() -> Self {
        Scope {
            handles: Arc::new(Mutex::new(Vec::new())),
            first_error: Arc::new(Mutex::new(None)),
            token: CancellationToken::new(),
        }
    }

    /// The cancellation token workers should select against at every
    /// suspension point.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// True once [`Scope::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawns a worker into this scope. A non-cancellation `Err` returned
    /// by `fut` cancels the whole scope and becomes (or is superseded by
    /// an earlier) the error surfaced at [`Scope::join`].
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = std::result::Result<(), Error>> + Send + 'static,
    {
        let handle = tokio::spawn(fut);
        self.handles.lock().unwrap().push(handle);
    }

    /// Cancels every worker in the scope.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for every spawned worker to finish, cancelling the remainder
    /// as soon as the first non-cancellation error appears, and returns
    /// that error (if any). Workers may spawn further workers (tap
    /// fan-out does this per item), so draining loops until no new
    /// handles appear.
    pub async fn join(&self) -> std::result::Result<(), Error> {
        loop {
            let batch: Vec<_> = {
                let mut handles = self.handles.lock().unwrap();
                std::mem::take(&mut *handles)
            };
            if batch.is_empty() {
                break;
            }
            for handle in batch {
                match handle.await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        self.token.cancel();
                        let mut first_error = self.first_error.lock().unwrap();
                        if first_error.is_none() {
                            *first_error = Some(err);
                        }
                    }
                    Err(join_err) => {
                        if join_err.is_cancelled() {
                            continue;
                        }
                        self.token.cancel();
                        let mut first_error = self.first_error.lock().unwrap();
                        if first_error.is_none() {
                            *first_error = Some(Error::Join(join_err));
                        }
                    }
                }
            }
        }
        self.first_error.lock().unwrap().take().map_or(Ok(()), Err)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_waits_for_all_workers() {
        let scope = Scope::new();
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        for _ in 0..3 {
            let counter = counter.clone();
            scope.spawn(async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            });
        }
        scope.join().await.unwrap();
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn first_error_cancels_and_surfaces() {
        let scope = Scope::new();
        let token = scope.cancellation_token();
        scope.spawn(async move { Err(Error::InvalidPipelineShape("boom".into())) });
        scope.spawn(async move {
            token.cancelled().await;
            Ok(())
        });
        let result = scope.join().await;
        assert!(matches!(result, Err(Error::InvalidPipelineShape(_))));
    }

    #[tokio::test]
    async fn workers_can_spawn_further_workers() {
        let scope = Scope::new();
        let counter = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let inner_scope = scope.clone();
        let inner_counter = counter.clone();
        scope.spawn(async move {
            inner_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let nested_counter = inner_counter.clone();
            inner_scope.spawn(async move {
                nested_counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            });
            Ok(())
        });
        scope.join().await.unwrap();
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
