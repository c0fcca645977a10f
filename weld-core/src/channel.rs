//! A bounded, single-producer/single-consumer channel whose default
//! capacity (`0`) is a true rendezvous: `send` does not return until a
//! receiver has actually taken the item.
//!
//! `tokio::sync::mpsc` cannot express capacity `0` — its bounded channel
//! always reserves at least one buffer slot — so the weld algorithm needs
//! its own primitive. The implementation keeps a small buffer (sized to
//! `capacity`) plus a FIFO of senders parked because the buffer is full;
//! a capacity-0 channel simply never fills its buffer, so every send
//! parks until a receiver hands it off directly.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::{Error, Result};

enum PendingRecv<T> {
    Waiting(oneshot::Sender<Option<T>>),
}

struct State<T> {
    buffer: VecDeque<T>,
    capacity: usize,
    pending_sends: VecDeque<(T, oneshot::Sender<Result<()>>)>,
    pending_recvs: VecDeque<(u64, PendingRecv<T>)>,
    next_recv_id: u64,
    send_closed: bool,
    recv_closed: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
}

impl<T> Inner<T> {
    fn close_send(&self) {
        let mut drain_recvs = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.send_closed {
                return;
            }
            state.send_closed = true;
            if state.buffer.is_empty() && state.pending_sends.is_empty() {
                while let Some((_, PendingRecv::Waiting(tx))) = state.pending_recvs.pop_front() {
                    drain_recvs.push(tx);
                }
            }
        }
        for tx in drain_recvs {
            let _ = tx.send(None);
        }
    }

    /// Closes the receive side. Also drains any still-registered
    /// `pending_recvs` entries (a `recv` call racing this close, or one
    /// whose cancellation-cleanup hasn't run yet) so none are left waiting
    /// on a channel nobody will ever signal again.
    fn close_recv(&self) {
        let mut drain_sends = Vec::new();
        let mut drain_recvs = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.recv_closed {
                return;
            }
            state.recv_closed = true;
            state.buffer.clear();
            while let Some((_, tx)) = state.pending_sends.pop_front() {
                drain_sends.push(tx);
            }
            while let Some((_, PendingRecv::Waiting(tx))) = state.pending_recvs.pop_front() {
                drain_recvs.push(tx);
            }
        }
        for tx in drain_sends {
            let _ = tx.send(Err(Error::BrokenResource));
        }
        for tx in drain_recvs {
            let _ = tx.send(None);
        }
    }

    /// Removes a single `pending_recvs` entry by id, if it is still there.
    /// Called by [`PendingRecvGuard`] when a `recv()` future is dropped
    /// before completing (e.g. a `select!` cancellation branch winning),
    /// so a cancelled receive never leaves a stale waiter for some later
    /// `send` to hand an item to and lose it.
    fn remove_pending_recv(&self, id: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(pos) = state
            .pending_recvs
            .iter()
            .position(|(entry_id, _)| *entry_id == id)
        {
            state.pending_recvs.remove(pos);
        }
    }
}

/// Guards a single `pending_recvs` registration: removes it on drop so a
/// cancelled `recv()` call doesn't leave a dangling waiter behind.
struct PendingRecvGuard<'a, T> {
    inner: &'a Inner<T>,
    id: u64,
}

impl<'a, T> Drop for PendingRecvGuard<'a, T> {
    fn drop(&mut self) {
        self.inner.remove_pending_recv(self.id);
    }
}

/// The sending half of a [`channel`]. Dropping it is equivalent to calling
/// [`Sender::close`].
pub struct Sender<T> {
    inner: Arc<Inner<T>>,
}

/// The receiving half of a [`channel`]. Dropping it is equivalent to
/// calling [`Receiver::close`].
pub struct Receiver<T> {
    inner: Arc<Inner<T>>,
}

/// Creates a new bounded channel. `capacity == 0` is a rendezvous channel:
/// the default, and the primary backpressure mechanism described by the
/// pipeline's concurrency model.
pub fn channel<T: Send + 'static>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State {
            buffer: VecDeque::new(),
            capacity,
            pending_sends: VecDeque::new(),
            pending_recvs: VecDeque::new(),
            next_recv_id: 0,
            send_closed: false,
            recv_closed: false,
        }),
    });
    (
        Sender {
            inner: inner.clone(),
        },
        Receiver { inner },
    )
}

impl<T: Send + 'static> Sender<T> {
    /// Sends `item`, suspending until the receiver has room (or, for a
    /// rendezvous channel, until the receiver is actually ready to take
    /// it). Fails with [`Error::BrokenResource`] if the receive side has
    /// been closed.
    pub async fn send(&self, item: T) -> Result<()> {
        let outcome = {
            let mut state = self.inner.state.lock().unwrap();
            if state.recv_closed {
                return Err(Error::BrokenResource);
            }
            // Hand the item straight to a parked receiver if one exists.
            if let Some((_, PendingRecv::Waiting(tx))) = state.pending_recvs.pop_front() {
                drop(state);
                let _ = tx.send(Some(item));
                return Ok(());
            }
            if state.buffer.len() < state.capacity {
                state.buffer.push_back(item);
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            state.pending_sends.push_back((item, tx));
            rx
        };
        outcome
            .await
            .unwrap_or(Err(Error::BrokenResource))
    }

    /// Closes the send side. Buffered items remain receivable; after they
    /// drain, `recv` reports end-of-channel.
    pub fn close(&self) {
        self.inner.close_send();
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.inner.close_send();
    }
}

impl<T: Send + 'static> Receiver<T> {
    /// Receives the next item, or `None` once the channel is exhausted
    /// (send side closed and drained).
    pub async fn recv(&mut self) -> Option<T> {
        let (outcome, _guard) = {
            let mut state = self.inner.state.lock().unwrap();
            if let Some(item) = state.buffer.pop_front() {
                if let Some((next_item, tx)) = state.pending_sends.pop_front() {
                    state.buffer.push_back(next_item);
                    let _ = tx.send(Ok(()));
                }
                return Some(item);
            }
            if let Some((item, tx)) = state.pending_sends.pop_front() {
                let _ = tx.send(Ok(()));
                return Some(item);
            }
            if state.send_closed {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_recv_id;
            state.next_recv_id += 1;
            state.pending_recvs.push_back((id, PendingRecv::Waiting(tx)));
            // If this `.await` is cancelled (e.g. the enclosing pump's
            // `select!` picks its cancellation branch instead), the guard's
            // drop removes this entry so a later `send` can't hand an item
            // to a waiter nothing will ever poll again.
            let guard = PendingRecvGuard {
                inner: &self.inner,
                id,
            };
            (rx, guard)
        };
        outcome.await.unwrap_or(None)
    }

    /// Closes the receive side. Any sender currently blocked on a full
    /// buffer is woken with [`Error::BrokenResource`]; future sends fail
    /// the same way.
    pub fn close(&self) {
        self.inner.close_recv();
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.inner.close_recv();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rendezvous_send_completes_only_after_recv() {
        let (tx, mut rx) = channel::<u32>(0);
        let sender = tokio::spawn(async move { tx.send(7).await });
        let item = rx.recv().await;
        assert_eq!(item, Some(7));
        assert!(sender.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn buffered_channel_allows_send_ahead_of_recv() {
        let (tx, mut rx) = channel::<u32>(2);
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn send_after_close_recv_is_broken_resource() {
        let (tx, rx) = channel::<u32>(0);
        drop(rx);
        let err = tx.send(1).await.unwrap_err();
        assert!(err.is_broken_resource());
    }

    #[tokio::test]
    async fn recv_after_close_send_drains_then_ends() {
        let (tx, mut rx) = channel::<u32>(4);
        tx.send(1).await.unwrap();
        tx.close();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn cancelled_recv_does_not_orphan_a_pending_slot() {
        let (tx, mut rx) = channel::<u32>(0);
        {
            let fut = rx.recv();
            tokio::pin!(fut);
            tokio::select! {
                _ = &mut fut => panic!("recv should still be parked, nothing has sent yet"),
                _ = tokio::task::yield_now() => {}
            }
            // `fut` drops here without completing, as a pump's `select!`
            // drops the losing `stage.run` future on cancellation.
        }
        // A send arriving afterward must reach a fresh `recv`, not the
        // stale, cancelled one.
        let sender = tokio::spawn(async move { tx.send(42).await });
        assert_eq!(rx.recv().await, Some(42));
        assert!(sender.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let (tx, mut rx) = channel::<u32>(0);
        let sender = tokio::spawn(async move {
            for i in 0..5 {
                tx.send(i).await.unwrap();
            }
        });
        let mut items = Vec::new();
        for _ in 0..5 {
            items.push(rx.recv().await.unwrap());
        }
        sender.await.unwrap();
        assert_eq!(items, vec![0, 1, 2, 3, 4]);
    }
}
