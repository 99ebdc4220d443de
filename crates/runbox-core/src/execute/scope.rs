//! Generation-bound cancellation scopes.
//!
//! A `CancellationScope` belongs to exactly one worker generation. Replies
//! reach a listener only if, at the moment of delivery, the scope is still
//! valid and the reply carries the scope's generation.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::ipc::{Generation, ReplyKind, WorkerReply};

/// Shared view of a scope's validity.
///
/// Clones are handed to worker reader tasks so they stop forwarding the
/// moment the scope is invalidated.
///
/// # Example
///
/// ```
/// use runbox_core::execute::ScopeToken;
///
/// let token = ScopeToken::new();
/// let reader_side = token.clone();
///
/// assert!(reader_side.is_valid());
/// token.invalidate();
/// assert!(!reader_side.is_valid());
/// ```
#[derive(Clone, Debug)]
pub struct ScopeToken {
    valid: Arc<AtomicBool>,
}

impl ScopeToken {
    pub fn new() -> Self {
        Self {
            valid: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Permanent; a token never becomes valid again.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }
}

impl Default for ScopeToken {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot handler invoked with the owner (usually the broker) and the reply.
pub type Listener<C> = Box<dyn FnOnce(&mut C, WorkerReply) + Send>;

/// Listener registry bound to one generation.
pub struct CancellationScope<C> {
    generation: Generation,
    token: ScopeToken,
    listeners: Vec<(ReplyKind, Listener<C>)>,
}

impl<C> CancellationScope<C> {
    pub fn create(generation: Generation) -> Self {
        Self {
            generation,
            token: ScopeToken::new(),
            listeners: Vec::new(),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn token(&self) -> ScopeToken {
        self.token.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.token.is_valid()
    }

    /// Make every registered and future listener inert.
    pub fn invalidate(&mut self) {
        self.token.invalidate();
        self.listeners.clear();
    }

    /// Register a one-shot listener for the next reply of `kind`.
    ///
    /// Registering on an invalidated scope is a no-op.
    pub fn listen<F>(&mut self, kind: ReplyKind, handler: F)
    where
        F: FnOnce(&mut C, WorkerReply) + Send + 'static,
    {
        if !self.is_valid() {
            tracing::debug!(generation = %self.generation, ?kind, "listen on invalidated scope ignored");
            return;
        }
        self.listeners.push((kind, Box::new(handler)));
    }

    /// Claim the listener a reply should be delivered to.
    ///
    /// Validity and generation are checked here, at delivery time. A
    /// returned listener has already been deregistered.
    pub fn take(&mut self, generation: Generation, kind: ReplyKind) -> Option<Listener<C>> {
        if !self.is_valid() || generation != self.generation {
            return None;
        }
        let index = self.listeners.iter().position(|(k, _)| *k == kind)?;
        Some(self.listeners.remove(index).1)
    }

    pub fn pending(&self) -> usize {
        self.listeners.len()
    }
}

impl<C> fmt::Debug for CancellationScope<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationScope")
            .field("generation", &self.generation)
            .field("valid", &self.is_valid())
            .field("pending", &self.listeners.len())
            .finish()
    }
}
