//! Message dispatch pipeline.
//!
//! Handlers are registered per direction under an owner handle and run in
//! registration order. Each handler sees the message through a
//! [`HandlerContext`] and may mutate it, veto forwarding, or append extra
//! messages. A veto never stops later handlers from running: the first veto
//! decides forwarding, every handler still observes the message.
//!
//! The handler table sits behind a mutex and is snapshotted before each
//! dispatch, so registration and removal may race freely with dispatch.
//! Once a removal returns, a handler is invoked at most once more (by a
//! dispatch whose snapshot was already taken).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::trace;

use crate::core::message::Message;
use crate::protocol::state::ConnectionState;

/// Traffic direction relative to the game client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Server to client
    Inbound,
    /// Client to server
    Outbound,
}

/// Opaque identity of a handler owner, used for bulk removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

impl OwnerId {
    /// Allocate a process-unique owner handle.
    pub fn next() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Whether a dispatched message should be forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Forward,
    Drop,
}

/// Mutable view handed to each handler.
pub struct HandlerContext<'a> {
    message: &'a mut Message,
    state: &'a mut ConnectionState,
    direction: Direction,
    now_us: i64,
    vetoed: bool,
    modified: bool,
    extra: Vec<Message>,
}

impl<'a> HandlerContext<'a> {
    pub fn new(
        message: &'a mut Message,
        state: &'a mut ConnectionState,
        direction: Direction,
        now_us: i64,
    ) -> Self {
        Self {
            message,
            state,
            direction,
            now_us,
            vetoed: false,
            modified: false,
            extra: Vec::new(),
        }
    }

    pub fn message(&self) -> &Message {
        &*self.message
    }

    /// Mutable access to the message; marks it as modified.
    pub fn message_mut(&mut self) -> &mut Message {
        self.modified = true;
        &mut *self.message
    }

    pub fn state(&mut self) -> &mut ConnectionState {
        &mut *self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Monotonic time at which dispatch of this message started.
    pub fn now_us(&self) -> i64 {
        self.now_us
    }

    /// Suppress forwarding of this message.
    pub fn veto(&mut self) {
        self.vetoed = true;
    }

    pub fn is_vetoed(&self) -> bool {
        self.vetoed
    }

    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Queue a synthetic message to be forwarded right after this one.
    pub fn push_extra(&mut self, message: Message) {
        self.extra.push(message);
    }
}

/// A message consumer.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, ctx: &mut HandlerContext<'_>);
}

impl<F> MessageHandler for F
where
    F: Fn(&mut HandlerContext<'_>) + Send + Sync,
{
    fn handle(&self, ctx: &mut HandlerContext<'_>) {
        self(ctx)
    }
}

/// Result of dispatching one message.
#[derive(Debug)]
pub struct DispatchOutcome {
    pub verdict: Verdict,
    /// Some handler requested mutable access to the message
    pub modified: bool,
    /// Messages to forward after this one, in the order they were pushed
    pub extra: Vec<Message>,
}

impl DispatchOutcome {
    /// Whether forwarding differs from passing the original bytes through.
    pub fn changes_stream(&self) -> bool {
        self.verdict == Verdict::Drop || self.modified || !self.extra.is_empty()
    }
}

struct Registration {
    id: u64,
    owner: OwnerId,
    direction: Direction,
    handler: Arc<dyn MessageHandler>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<Registration>,
}

/// Ordered, cancelable dispatch of messages to registered handlers.
#[derive(Clone, Default)]
pub struct MessagePipeline {
    inner: Arc<Mutex<Registry>>,
}

impl fmt::Debug for MessagePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessagePipeline")
            .field("inbound", &self.handler_count(Direction::Inbound))
            .field("outbound", &self.handler_count(Direction::Outbound))
            .finish()
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    // handlers never run under the lock
    registry
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MessagePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `direction`.
    ///
    /// The handler stays registered until the returned [`Subscription`] is
    /// dropped or [`remove_all`](Self::remove_all) is called for `owner`.
    pub fn register<H>(&self, owner: OwnerId, direction: Direction, handler: H) -> Subscription
    where
        H: MessageHandler + 'static,
    {
        let mut registry = lock(&self.inner);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.handlers.push(Registration {
            id,
            owner,
            direction,
            handler: Arc::new(handler),
        });
        trace!(?owner, ?direction, id, "Handler registered");

        Subscription {
            registry: Arc::downgrade(&self.inner),
            id,
            owner,
        }
    }

    /// Remove every handler registered by `owner`; returns how many were removed.
    pub fn remove_all(&self, owner: OwnerId) -> usize {
        let mut registry = lock(&self.inner);
        let before = registry.handlers.len();
        registry.handlers.retain(|r| r.owner != owner);
        before - registry.handlers.len()
    }

    pub fn handler_count(&self, direction: Direction) -> usize {
        lock(&self.inner)
            .handlers
            .iter()
            .filter(|r| r.direction == direction)
            .count()
    }

    fn snapshot(&self, direction: Direction) -> Vec<Arc<dyn MessageHandler>> {
        lock(&self.inner)
            .handlers
            .iter()
            .filter(|r| r.direction == direction)
            .map(|r| Arc::clone(&r.handler))
            .collect()
    }

    /// Run every handler registered for `direction` over `message`.
    pub fn dispatch(
        &self,
        direction: Direction,
        message: &mut Message,
        state: &mut ConnectionState,
        now_us: i64,
    ) -> DispatchOutcome {
        let handlers = self.snapshot(direction);
        let mut ctx = HandlerContext::new(message, state, direction, now_us);
        for handler in &handlers {
            handler.handle(&mut ctx);
        }

        DispatchOutcome {
            verdict: if ctx.vetoed {
                Verdict::Drop
            } else {
                Verdict::Forward
            },
            modified: ctx.modified,
            extra: ctx.extra,
        }
    }
}

/// Scoped registration; dropping it removes the handler.
#[must_use = "dropping a Subscription unregisters its handler"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    id: u64,
    owner: OwnerId,
}

impl Subscription {
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// Whether the handler is still registered.
    pub fn is_active(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let registry = lock(&registry);
        registry.handlers.iter().any(|r| r.id == self.id)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).handlers.retain(|r| r.id != self.id);
        }
    }
}
