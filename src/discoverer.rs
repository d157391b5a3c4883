//! The polymorphic discovery capability and its companion handles.

use std::collections::HashMap;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::event::Event;

/// Service registration and discovery over one backend generation.
///
/// Two realizations exist: [`V2Discoverer`](crate::V2Discoverer) over the
/// TTL-refresh keys API and [`V3Discoverer`](crate::V3Discoverer) over
/// lease grant + keepalive. Their lease models differ; this trait unifies
/// only the external contract.
#[async_trait]
pub trait Discoverer: Send + Sync {
    /// Advertise `(namespace, name, addr)` with a bounded lifetime.
    ///
    /// Fails with [`Error::AlreadyRegistered`](crate::Error::AlreadyRegistered)
    /// if an entry already exists at `(namespace, name)`; the check is
    /// atomic in the store. On success the entry is immediately visible
    /// to [`services`](Discoverer::services) and to watchers as a
    /// `created` event.
    ///
    /// The returned [`KeepAlive`] must be invoked on a caller-owned timer
    /// to renew the entry before `ttl` lapses.
    async fn register(
        &self,
        namespace: &str,
        name: &str,
        addr: &str,
        ttl: Duration,
    ) -> Result<KeepAlive>;

    /// Remove the entry at `(namespace, name)`.
    ///
    /// Watchers observe a `deleted` event. Removing an absent entry
    /// reports [`Error::NotRegistered`](crate::Error::NotRegistered)
    /// and is otherwise harmless.
    async fn unregister(&self, namespace: &str, name: &str) -> Result<()>;

    /// Subscribe to membership changes under `namespace`.
    ///
    /// Returns immediately; events are delivered asynchronously on the
    /// [`Events`] stream, which closes exactly once: on cancellation via
    /// the [`WatchHandle`] or on an unrecoverable backend failure.
    async fn watch(&self, namespace: &str) -> Result<(Events, WatchHandle)>;

    /// Point-in-time snapshot of `namespace` as a name → address map.
    ///
    /// Not guaranteed consistent with concurrently delivered watch
    /// events; callers must tolerate eventual consistency between the
    /// two.
    async fn services(&self, namespace: &str) -> Result<HashMap<String, String>>;

    /// Release backend resources and cancel every live watch.
    ///
    /// Terminal: all subsequent operations fail with
    /// [`Error::Closed`](crate::Error::Closed).
    async fn close(&self) -> Result<()>;

    /// The active backend generation (2 or 3), for callers that need
    /// generation-specific tuning such as TTL granularity.
    fn version(&self) -> u8;
}

type RenewFn = Box<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Renewal capability bound to one registered entry.
///
/// Each [`keep_alive`](KeepAlive::keep_alive) call performs exactly one
/// renewal round trip; it never schedules retries. The caller owns the
/// timing and should invoke it comfortably inside the registration TTL.
pub struct KeepAlive {
    renew: RenewFn,
}

impl KeepAlive {
    pub(crate) fn new<F>(renew: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self {
            renew: Box::new(renew),
        }
    }

    /// Perform one renewal attempt.
    ///
    /// A [`NotRegistered`](crate::Error::NotRegistered) failure means the
    /// entry is already gone; the caller must re-register, not retry.
    pub async fn keep_alive(&self) -> Result<()> {
        (self.renew)().await
    }
}

impl fmt::Debug for KeepAlive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeepAlive").finish_non_exhaustive()
    }
}

/// Stream of normalized watch events for one subscription.
///
/// Closes exactly once. Events buffered before a cancellation are drained,
/// not discarded.
pub struct Events {
    rx: ReceiverStream<Event>,
}

impl Events {
    pub(crate) fn new(rx: mpsc::Receiver<Event>) -> Self {
        Self {
            rx: ReceiverStream::new(rx),
        }
    }

    /// Receive the next event; `None` once the watch has terminated.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.next().await
    }
}

impl Stream for Events {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events").finish_non_exhaustive()
    }
}

/// Cancellation capability for one background watch.
#[derive(Debug, Clone)]
pub struct WatchHandle {
    token: CancellationToken,
}

impl WatchHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Request termination of the watch. Idempotent; returns without
    /// blocking on in-flight delivery. No further events are emitted once
    /// the watch task observes the signal.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether this watch was cancelled, by [`cancel`](WatchHandle::cancel)
    /// or by the owning discoverer closing. Lets callers distinguish a
    /// deliberate shutdown from a backend failure after the event stream
    /// closes.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
