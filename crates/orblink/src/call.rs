//! # Outbound Calls
//!
//! Calls are correlated with their replies by message id. A pending entry is
//! registered before the call is sent, so a reply can never beat its entry.

use std::sync::Arc;
use std::sync::Weak;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::trace;

use orbpack::Value;

use crate::error::CallError;
use crate::error::LinkError;
use crate::message::MessageCode;

pub type CallOutcome = Result<Value, CallError>;

/// How the peer should answer a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Reply with the result value.
    Normal,
    /// Reply with `None` once the call finished.
    VoidResult,
    /// Send no reply at all.
    NoReturn,
}

impl CallMode {
    pub fn code(self) -> MessageCode {
        match self {
            Self::Normal => MessageCode::MethodCall,
            Self::VoidResult => MessageCode::MethodCallVoidResult,
            Self::NoReturn => MessageCode::MethodCallNoReturn,
        }
    }
}

#[derive(Default)]
pub(crate) struct PendingCalls {
    map: DashMap<u64, oneshot::Sender<CallOutcome>>,
}

impl PendingCalls {
    pub(crate) fn register(&self, id: u64) -> oneshot::Receiver<CallOutcome> {
        let (tx, rx) = oneshot::channel();
        self.map.insert(id, tx);
        rx
    }

    /// Hands `outcome` to the caller; false if nobody waits for `id`.
    pub(crate) fn resolve(&self, id: u64, outcome: CallOutcome) -> bool {
        let Some((_, tx)) = self.map.remove(&id) else {
            trace!(call_id = id, "discarding reply to unknown or cancelled call");
            return false;
        };
        // the receiver may be gone already; nothing to do then
        let _ = tx.send(outcome);
        true
    }

    pub(crate) fn forget(&self, id: u64) {
        self.map.remove(&id);
    }

    pub(crate) fn fail_all(&self, error: CallError) {
        let keys: Vec<u64> = self.map.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, tx)) = self.map.remove(&key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }
}

/// A call that was sent and awaits its reply.
///
/// Dropping it cancels the call locally; a late reply is discarded.
pub struct PendingCall {
    id: u64,
    rx: Option<oneshot::Receiver<CallOutcome>>,
    calls: Weak<PendingCalls>,
}

impl PendingCall {
    pub(crate) fn new(id: u64, rx: oneshot::Receiver<CallOutcome>, calls: &Arc<PendingCalls>) -> Self {
        Self {
            id,
            rx: Some(rx),
            calls: Arc::downgrade(calls),
        }
    }

    /// A call that completed on sending.
    pub(crate) fn ready(id: u64, outcome: CallOutcome) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { id, rx: Some(rx), calls: Weak::new() }
    }

    /// Message id the call went out with.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn result(mut self) -> CallOutcome {
        let Some(rx) = self.rx.take() else {
            return Err(CallError::Cancelled);
        };
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CallError::Link(LinkError::Closed)),
        }
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if let Some(calls) = self.calls.upgrade() {
            calls.forget(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_once() {
        let calls = Arc::new(PendingCalls::default());
        let pending = PendingCall::new(3, calls.register(3), &calls);
        assert!(calls.resolve(3, Ok(Value::from(10))));
        assert!(!calls.resolve(3, Ok(Value::from(11))));
        assert_eq!(pending.result().await, Ok(Value::from(10)));
    }

    #[tokio::test]
    async fn test_cancel_discards_late_reply() {
        let calls = Arc::new(PendingCalls::default());
        let pending = PendingCall::new(4, calls.register(4), &calls);
        pending.cancel();
        assert_eq!(calls.len(), 0);
        assert!(!calls.resolve(4, Ok(Value::None)));
    }

    #[tokio::test]
    async fn test_fail_all_reaches_every_caller() {
        let calls = Arc::new(PendingCalls::default());
        let a = PendingCall::new(1, calls.register(1), &calls);
        let b = PendingCall::new(2, calls.register(2), &calls);
        calls.fail_all(CallError::Link(LinkError::Closed));
        assert_eq!(a.result().await, Err(CallError::Link(LinkError::Closed)));
        assert_eq!(b.result().await, Err(CallError::Link(LinkError::Closed)));
    }
}
