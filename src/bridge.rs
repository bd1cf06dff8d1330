//! Flow-controlled hand-off between a chunk producer and a chunk consumer.
//!
//! A bridge is a one-slot rendezvous: the producer [`push`](BridgeSender::push)es
//! chunks, the consumer polls them out of the [`BridgeReceiver`] stream, and
//! at most one chunk is ever parked in between. The consumer controls how many
//! chunks it is willing to take through its demand counter:
//!
//! - [`Demand::Unbounded`] (flowing mode) hands every chunk out as soon as it
//!   is polled, so the producer runs at the consumer's pace.
//! - [`Demand::Bounded`] releases at most that many chunks; with zero demand
//!   the parked chunk stays put and the producer is suspended until
//!   [`fetch`](BridgeReceiver::fetch) raises demand again.
//!
//! [`pump`] connects a pull-based [`ByteStream`] to the push side, which is
//! how bodies travel between the caller and the transports.

use std::{
    future::poll_fn,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::{Context, Poll, Waker},
};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;

use crate::{ByteStream, Error, Result};

/// Number of chunks the consumer is willing to accept.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Demand {
    Bounded(u64),
    Unbounded,
}

impl Demand {
    fn is_zero(self) -> bool {
        self == Demand::Bounded(0)
    }

    fn add(self, n: u64) -> Self {
        match self {
            Demand::Bounded(current) => Demand::Bounded(current.saturating_add(n)),
            Demand::Unbounded => Demand::Unbounded,
        }
    }

    fn consume_one(self) -> Self {
        match self {
            Demand::Bounded(current) => Demand::Bounded(current.saturating_sub(1)),
            Demand::Unbounded => Demand::Unbounded,
        }
    }
}

/// Lifecycle of a bridge.
///
/// `Idle -> Producing -> {Paused <-> Producing} -> Draining -> Ended`, with
/// `Failed` reachable from every non-terminal state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BridgeState {
    /// Nothing pushed yet.
    Idle,
    Producing,
    /// A chunk is parked and the consumer has no demand for it.
    Paused,
    /// Producer finished, a parked chunk is still waiting for the consumer.
    Draining,
    Ended,
    Failed,
}

impl BridgeState {
    fn is_terminal(self) -> bool {
        matches!(self, BridgeState::Ended | BridgeState::Failed)
    }
}

struct Shared {
    state: BridgeState,
    demand: Demand,
    slot: Option<Bytes>,
    started: bool,
    finished: bool,
    /// Terminal error not yet observed by the consumer.
    error: Option<Error>,
    producer: Option<Waker>,
    consumer: Option<Waker>,
}

impl Shared {
    fn settle(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = if self.finished {
            if self.slot.is_some() {
                BridgeState::Draining
            } else {
                BridgeState::Ended
            }
        } else if self.slot.is_some() && self.demand.is_zero() {
            BridgeState::Paused
        } else if self.started {
            BridgeState::Producing
        } else {
            BridgeState::Idle
        };
    }

    fn fail(&mut self, error: Option<Error>) {
        self.slot = None;
        self.error = error;
        self.state = BridgeState::Failed;
    }

    fn wake_producer(&mut self) {
        if let Some(waker) = self.producer.take() {
            waker.wake();
        }
    }

    fn wake_consumer(&mut self) {
        if let Some(waker) = self.consumer.take() {
            waker.wake();
        }
    }
}

fn register(slot: &mut Option<Waker>, cx: &Context<'_>) {
    match slot {
        Some(waker) if waker.will_wake(cx.waker()) => {}
        _ => *slot = Some(cx.waker().clone()),
    }
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates a bridge whose consumer starts with `demand`.
pub fn channel(demand: Demand) -> (BridgeSender, BridgeReceiver) {
    let shared = Arc::new(Mutex::new(Shared {
        state: BridgeState::Idle,
        demand,
        slot: None,
        started: false,
        finished: false,
        error: None,
        producer: None,
        consumer: None,
    }));
    (
        BridgeSender {
            shared: shared.clone(),
            closed: false,
        },
        BridgeReceiver { shared },
    )
}

/// Push side of a bridge.
///
/// Dropping the sender without calling [`finish`](Self::finish) or
/// [`fail`](Self::fail) terminates the consumer with [`Error::Cancelled`].
pub struct BridgeSender {
    shared: Arc<Mutex<Shared>>,
    closed: bool,
}

impl BridgeSender {
    /// Hands one chunk to the consumer.
    ///
    /// Suspends while a previous chunk is still parked. Fails with
    /// [`Error::Cancelled`] once the consumer went away.
    pub async fn push(&mut self, chunk: Bytes) -> Result<()> {
        poll_fn(|cx| self.poll_ready(cx)).await?;
        let mut shared = lock(&self.shared);
        if shared.state == BridgeState::Failed {
            return Err(Error::Cancelled);
        }
        shared.slot = Some(chunk);
        shared.started = true;
        shared.settle();
        shared.wake_consumer();
        Ok(())
    }

    fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        let mut shared = lock(&self.shared);
        if shared.state == BridgeState::Failed {
            return Poll::Ready(Err(Error::Cancelled));
        }
        if shared.slot.is_some() {
            register(&mut shared.producer, cx);
            return Poll::Pending;
        }
        Poll::Ready(Ok(()))
    }

    /// Resolves once the consumer cancelled the transfer.
    pub async fn cancelled(&self) {
        poll_fn(|cx| {
            let mut shared = lock(&self.shared);
            if shared.state == BridgeState::Failed {
                Poll::Ready(())
            } else {
                register(&mut shared.producer, cx);
                Poll::Pending
            }
        })
        .await
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.shared).state == BridgeState::Failed
    }

    /// Signals end-of-stream; a parked chunk is still delivered first.
    pub fn finish(mut self) {
        self.closed = true;
        let mut shared = lock(&self.shared);
        shared.finished = true;
        shared.settle();
        shared.wake_consumer();
    }

    /// Terminates the transfer with `error`, discarding any parked chunk.
    pub fn fail(mut self, error: Error) {
        self.closed = true;
        let mut shared = lock(&self.shared);
        if shared.state.is_terminal() {
            return;
        }
        shared.fail(Some(error));
        shared.wake_consumer();
    }
}

impl Drop for BridgeSender {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let mut shared = lock(&self.shared);
        if shared.state.is_terminal() || shared.finished {
            return;
        }
        shared.fail(Some(Error::Cancelled));
        shared.wake_consumer();
    }
}

/// Pull side of a bridge, consumed as a [`Stream`] of chunks.
pub struct BridgeReceiver {
    shared: Arc<Mutex<Shared>>,
}

impl BridgeReceiver {
    /// Allows `n` more chunks to be handed out.
    pub fn fetch(&self, n: u64) {
        let mut shared = lock(&self.shared);
        shared.demand = shared.demand.add(n);
        shared.settle();
        shared.wake_consumer();
    }

    /// Switches to flowing mode.
    pub fn resume(&self) {
        let mut shared = lock(&self.shared);
        shared.demand = Demand::Unbounded;
        shared.settle();
        shared.wake_consumer();
    }

    /// Stops handing out chunks until the next `fetch` or `resume`.
    pub fn pause(&self) {
        let mut shared = lock(&self.shared);
        shared.demand = Demand::Bounded(0);
        shared.settle();
    }

    pub fn demand(&self) -> Demand {
        lock(&self.shared).demand
    }

    pub fn state(&self) -> BridgeState {
        lock(&self.shared).state
    }

    /// Number of parked chunks, either 0 or 1.
    pub fn parked(&self) -> usize {
        usize::from(lock(&self.shared).slot.is_some())
    }

    /// Stops the transfer; the producer's pending and later pushes fail with
    /// [`Error::Cancelled`].
    pub fn cancel(&mut self) {
        let mut shared = lock(&self.shared);
        if shared.state.is_terminal() {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(state = ?shared.state, "stream bridge cancelled by consumer");
        shared.fail(None);
        shared.wake_producer();
    }

    /// Waits for the next chunk; `None` after end-of-stream or a terminal
    /// error.
    pub async fn recv(&mut self) -> Option<Result<Bytes>> {
        self.next().await
    }
}

impl Stream for BridgeReceiver {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut shared = lock(&self.shared);
        if let Some(error) = shared.error.take() {
            return Poll::Ready(Some(Err(error)));
        }
        if shared.state == BridgeState::Failed {
            return Poll::Ready(None);
        }

        if shared.slot.is_some() {
            if shared.demand.is_zero() {
                shared.settle();
                register(&mut shared.consumer, cx);
                return Poll::Pending;
            }
            let chunk = shared.slot.take();
            shared.demand = shared.demand.consume_one();
            shared.settle();
            shared.wake_producer();
            return Poll::Ready(chunk.map(Ok));
        }

        if shared.finished {
            shared.settle();
            return Poll::Ready(None);
        }
        register(&mut shared.consumer, cx);
        Poll::Pending
    }
}

impl Drop for BridgeReceiver {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Drives `source` into `sender` until the source ends, fails, or the
/// consumer cancels.
///
/// Source errors are forwarded to the consumer. Returns
/// [`Error::Cancelled`] when the consumer stopped the transfer, in which
/// case `source` is dropped without being polled again.
pub async fn pump(mut source: ByteStream, mut sender: BridgeSender) -> Result<()> {
    loop {
        let next = tokio::select! {
            biased;
            _ = sender.cancelled() => return Err(Error::Cancelled),
            next = source.next() => next,
        };
        match next {
            Some(Ok(chunk)) if chunk.is_empty() => {}
            Some(Ok(chunk)) => sender.push(chunk).await?,
            Some(Err(error)) => {
                sender.fail(error);
                return Ok(());
            }
            None => {
                sender.finish();
                return Ok(());
            }
        }
    }
}

/// Spawns a [`pump`] for `source` onto the runtime and returns the flowing
/// consumer side.
pub fn spawn_pump(source: ByteStream) -> BridgeReceiver {
    let (sender, receiver) = channel(Demand::Unbounded);
    tokio::spawn(async move {
        if let Err(_err) = pump(source, sender).await {
            #[cfg(feature = "tracing")]
            tracing::debug!(error = %_err, "stream pump stopped");
        }
    });
    receiver
}
