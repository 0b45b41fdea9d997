use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use crate::error::InboxError;
use crate::model::InboxReadyResult;

/// Authorization state of one inbox. Owned by exactly one state machine.
#[derive(Clone)]
pub enum AuthorizationState {
    Uninitialized,
    Initializing,
    Authorizing,
    Registering,
    Ready(InboxReadyResult),
    Stopping,
    Error(Arc<InboxError>),
}

impl AuthorizationState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Authorizing => "authorizing",
            Self::Registering => "registering",
            Self::Ready(_) => "ready",
            Self::Stopping => "stopping",
            Self::Error(_) => "error",
        }
    }

    pub fn ready(&self) -> Option<&InboxReadyResult> {
        match self {
            Self::Ready(result) => Some(result),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    pub fn error(&self) -> Option<&Arc<InboxError>> {
        match self {
            Self::Error(err) => Some(err),
            _ => None,
        }
    }
}

// `ready` compares by (inbox id, installation id, session id) so observers can dedupe
// repeated authorizations that resolve to the same session.
impl PartialEq for AuthorizationState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Ready(a), Self::Ready(b)) => a.identity_key() == b.identity_key(),
            (Self::Error(a), Self::Error(b)) => a.to_string() == b.to_string(),
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

impl Eq for AuthorizationState {}

impl fmt::Debug for AuthorizationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Self::Error(err) => f.debug_tuple("Error").field(&err.to_string()).finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// Current state plus a transition feed. Snapshot and subscription are taken under the same
/// lock as updates, so a new subscriber never misses or duplicates a transition.
pub(crate) struct StateCell {
    current: Mutex<AuthorizationState>,
    events: broadcast::Sender<AuthorizationState>,
}

impl StateCell {
    pub(crate) fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            current: Mutex::new(AuthorizationState::Uninitialized),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AuthorizationState> {
        match self.current.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    pub(crate) fn get(&self) -> AuthorizationState {
        self.lock().clone()
    }

    /// Replaces the state and publishes it. Returns the previous state.
    pub(crate) fn set(&self, next: AuthorizationState) -> AuthorizationState {
        let mut current = self.lock();
        let previous = std::mem::replace(&mut *current, next.clone());
        // No subscribers is fine.
        let _ = self.events.send(next);
        previous
    }

    pub(crate) fn subscribe(&self) -> StateStream {
        let current = self.lock();
        StateStream {
            replay: Some(current.clone()),
            events: self.events.subscribe(),
        }
    }
}

/// Yields the current state first, then every subsequent transition.
pub struct StateStream {
    replay: Option<AuthorizationState>,
    events: broadcast::Receiver<AuthorizationState>,
}

impl StateStream {
    /// Next state, or `None` once the state machine is gone.
    pub async fn next(&mut self) -> Option<AuthorizationState> {
        if let Some(state) = self.replay.take() {
            return Some(state);
        }
        loop {
            match self.events.recv().await {
                Ok(state) => return Some(state),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "state subscriber lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Waits for the first state matching `pred`.
    pub async fn wait_for(
        &mut self,
        mut pred: impl FnMut(&AuthorizationState) -> bool,
    ) -> Option<AuthorizationState> {
        while let Some(state) = self.next().await {
            if pred(&state) {
                return Some(state);
            }
        }
        None
    }

    /// Resolves on the next `ready` or `error`.
    pub async fn wait_for_ready(&mut self) -> Result<InboxReadyResult, Arc<InboxError>> {
        match self
            .wait_for(|s| matches!(s, AuthorizationState::Ready(_) | AuthorizationState::Error(_)))
            .await
        {
            Some(AuthorizationState::Ready(result)) => Ok(result),
            Some(AuthorizationState::Error(err)) => Err(err),
            _ => Err(Arc::new(InboxError::Stopped)),
        }
    }
}
