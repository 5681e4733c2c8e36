//! # Link Handshake
//!
//! After the hellos, each side publishes a short-lived handshake object and
//! calls the peer's. The exchange on the peer's object is:
//!
//! 1. `("keep_alive", period_ms)`, only if a period is configured. The reply
//!    is the period the peer will send at.
//! 2. `("finish",)`, answered with the peer gateway once the peer is ready.
//!
//! A side is ready to answer `finish` after its own keep-alive negotiation,
//! so a `finish` that arrives early is parked until then. The link runs once
//! a side has both sent its gateway and received the peer's.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use orbpack::CallContext;
use orbpack::CallFailure;
use orbpack::CallResult;
use orbpack::Object;
use orbpack::ObjectRef;
use orbpack::RemoteRef;
use orbpack::Value;

use crate::call::CallMode;
use crate::error::LinkError;
use crate::error::Result;
use crate::keepalive;
use crate::link::Inner;

#[derive(Default)]
struct State {
    /// Local keep-alive negotiation is over; `finish` may answer at once.
    allow_finish: bool,
    sent_gateway: bool,
    got_gateway: bool,
    keep_alive_set: bool,
    waiting_finish: Option<oneshot::Sender<Value>>,
    /// The peer's handshake object, held until both gateways are exchanged.
    peer: Option<RemoteRef>,
}

pub(crate) struct HandshakeObject {
    link: Weak<Inner>,
    state: Mutex<State>,
}

impl HandshakeObject {
    pub(crate) fn new(link: Weak<Inner>) -> Self {
        Self {
            link,
            state: Mutex::new(State::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn link(&self) -> std::result::Result<Arc<Inner>, CallFailure> {
        self.link
            .upgrade()
            .ok_or_else(|| CallFailure::invalid("link is gone"))
    }

    async fn finish(&self) -> CallResult {
        let link = self.link()?;
        let waiting = {
            let mut state = self.state();
            if state.sent_gateway || state.waiting_finish.is_some() {
                return Err(CallFailure::invalid("finish called twice"));
            }
            if state.allow_finish {
                state.sent_gateway = true;
                let done = state.got_gateway;
                if done {
                    state.peer = None;
                }
                drop(state);
                if done {
                    link.handshake_completed();
                }
                return Ok(link.local_gateway());
            }
            let (tx, rx) = oneshot::channel();
            state.waiting_finish = Some(tx);
            rx
        };
        waiting
            .await
            .map_err(|_| CallFailure::invalid("link closed during handshake"))
    }

    fn keep_alive(&self, period: &Value) -> CallResult {
        let link = self.link()?;
        let mut state = self.state();
        if state.keep_alive_set {
            return Err(CallFailure::invalid("keep-alive negotiated twice"));
        }
        let Some(ms) = period.as_u64().filter(|ms| *ms > 0) else {
            return Err(CallFailure::invalid("keep-alive period must be a positive integer"));
        };
        state.keep_alive_set = true;
        drop(state);

        let granted = keepalive::grant(Duration::from_millis(ms), &link.config().keep_alive);
        link.set_keep_alive_send(granted);
        Ok(Value::from(millis(granted)))
    }

    /// Local side is ready: answer a parked `finish` or let the next one through.
    fn can_finish(&self, link: &Inner) {
        let mut state = self.state();
        match state.waiting_finish.take() {
            Some(tx) => {
                state.sent_gateway = true;
                drop(state);
                // the parked call has no receiver left if it was cancelled
                let _ = tx.send(link.local_gateway());
            }
            None => state.allow_finish = true,
        }
    }

    /// Records the peer gateway; true once our own gateway went out too.
    fn got_gateway(&self) -> bool {
        let mut state = self.state();
        state.got_gateway = true;
        if state.sent_gateway {
            state.peer = None;
        }
        state.sent_gateway
    }

    pub(crate) fn set_peer(&self, peer: RemoteRef) {
        self.state().peer = Some(peer);
    }
}

#[async_trait::async_trait]
impl Object for HandshakeObject {
    async fn execute(&self, args: Vec<Value>, _ctx: &CallContext) -> CallResult {
        let outcome = match args.as_slice() {
            [Value::Utf(name)] if name == "finish" => self.finish().await,
            [Value::Utf(name), period] if name == "keep_alive" => self.keep_alive(period),
            _ => Err(CallFailure::invalid("unknown handshake call")),
        };
        if let Err(e) = &outcome {
            warn!(error = %e, "peer broke the link handshake");
            if let Some(link) = self.link.upgrade() {
                link.abort(LinkError::Handshake(e.to_string()));
            }
        }
        outcome
    }
}

/// Drives our side of the exchange against the peer's handshake object.
pub(crate) async fn run(handshake: Arc<HandshakeObject>, link: Arc<Inner>, peer: RemoteRef) {
    handshake.set_peer(peer.clone());
    if let Err(e) = negotiate(&handshake, &link, peer).await {
        warn!(error = %e, "link handshake failed");
        link.abort(e);
    }
}

async fn negotiate(handshake: &HandshakeObject, link: &Arc<Inner>, peer: RemoteRef) -> Result<()> {
    if let Some(requested) = link.config().keep_alive.request {
        let requested_ms = millis(requested);
        let granted = link
            .call(&peer, vec![Value::from("keep_alive"), Value::from(requested_ms)], CallMode::Normal)
            .await
            .map_err(|e| LinkError::Handshake(format!("keep-alive negotiation: {}", e)))?;
        let granted = granted
            .as_u64()
            .filter(|ms| *ms >= requested_ms)
            .ok_or_else(|| LinkError::Handshake("peer granted an invalid keep-alive period".into()))?;
        debug!(requested_ms, granted_ms = granted, "keep-alive negotiated");
        link.set_keep_alive_recv(Duration::from_millis(granted));
    }

    handshake.can_finish(link);

    let gateway = link
        .call(&peer, vec![Value::from("finish")], CallMode::Normal)
        .await
        .map_err(|e| LinkError::Handshake(format!("finish: {}", e)))?;
    let Value::Object(ObjectRef::Remote(gateway)) = gateway else {
        return Err(LinkError::Handshake("peer gateway is not a remote reference".into()));
    };
    drop(peer);

    link.submit_peer_gateway(gateway);
    if handshake.got_gateway() {
        link.handshake_completed();
    }
    Ok(())
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
