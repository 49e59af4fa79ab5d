//! Reply router - routes call responses back to their waiting callers.

use std::{fmt, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::{CallResult, ServerError, observer::Observer};

/// Unique value linking a call to its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationToken(Uuid);

impl CorrelationToken {
    pub fn new() -> Self {
        CorrelationToken(Uuid::new_v4())
    }
}

impl Default for CorrelationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call {}", self.0)
    }
}

type SlotSender<R> = oneshot::Sender<CallResult<R>>;

pub(crate) struct ReplyRouter<R> {
    server: String,
    slots: DashMap<CorrelationToken, SlotSender<R>>,
    observer: Arc<dyn Observer>,
}

impl<R: Send + 'static> ReplyRouter<R> {
    pub fn new(server: String, observer: Arc<dyn Observer>) -> Self {
        ReplyRouter {
            server,
            slots: DashMap::new(),
            observer,
        }
    }

    /// Creates the slot for `token`. Must happen before the call is enqueued, otherwise
    /// the reply can race ahead of its slot.
    pub fn register(self: &Arc<Self>, token: CorrelationToken) -> ReplySlot<R> {
        let (sender, receiver) = oneshot::channel();
        self.slots.insert(token, sender);
        ReplySlot {
            token,
            receiver,
            router: self.clone(),
        }
    }

    /// Delivers `value` to the caller waiting on `token`, at most once.
    pub fn deliver(&self, token: CorrelationToken, value: CallResult<R>) {
        match self.slots.remove(&token) {
            Some((_, sender)) => {
                if sender.send(value).is_err() {
                    self.observer.late_reply(&self.server, token);
                }
            }
            None => self.observer.late_reply(&self.server, token),
        }
    }

    pub fn cleanup(&self, token: CorrelationToken) {
        self.slots.remove(&token);
    }

    /// Drops every outstanding slot; their callers see the server as gone.
    pub fn abandon_all(&self) {
        self.slots.clear();
    }

    pub fn pending(&self) -> usize {
        self.slots.len()
    }
}

/// The caller's half of a reply slot. Dropping it removes the slot from the router.
pub(crate) struct ReplySlot<R: Send + 'static> {
    token: CorrelationToken,
    receiver: oneshot::Receiver<CallResult<R>>,
    router: Arc<ReplyRouter<R>>,
}

impl<R: Send + 'static> ReplySlot<R> {
    pub fn token(&self) -> CorrelationToken {
        self.token
    }

    /// Waits for the reply, for at most `timeout` when one is given.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<CallResult<R>, ServerError> {
        let received = match timeout {
            Some(timeout) => tokio::time::timeout(timeout, &mut self.receiver)
                .await
                .map_err(|_| ServerError::CallTimeout(timeout))?,
            None => (&mut self.receiver).await,
        };
        received.map_err(|_| ServerError::NotRunning)
    }
}

impl<R: Send + 'static> Drop for ReplySlot<R> {
    fn drop(&mut self) {
        self.router.cleanup(self.token);
    }
}
