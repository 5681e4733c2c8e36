//! # Link
//!
//! One session between two peers over a byte-stream transport.
//!
//! ## Lifecycle
//!
//! `Handshaking -> Running -> Closing -> Closed`, or straight from
//! `Handshaking` to `Closing` when the handshake fails or times out.
//!
//! ## Tasks
//!
//! - The pump reads the transport, rebuilds values and handles them in
//!   arrival order. Calls it receives run as separate tasks on the spawner.
//! - The deref task turns dropped remote proxies into NOTIFY_DEREF messages.
//! - Proxies from this link passed on over another link are called through
//!   the `CallRouter` installed on the context.
//! - Keep-alive tasks send and watch for signs of life once running.
//!
//! Every outbound value is minted, encoded and handed to the transport
//! under one send lock, so message ids hit the wire in order.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::sync::Weak;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use orbpack::CallContext;
use orbpack::CallFailure;
use orbpack::CallResult;
use orbpack::Context;
use orbpack::DerefHook;
use orbpack::Encoder;
use orbpack::LocalObject;
use orbpack::Object;
use orbpack::ObjectRef;
use orbpack::Reader;
use orbpack::Release;
use orbpack::RemoteCaller;
use orbpack::RemoteRef;
use orbpack::Value;
use orbpack::WeakRemoteRef;
use orbpack::tuple;

use crate::call::CallMode;
use crate::call::PendingCall;
use crate::call::PendingCalls;
use crate::config::LinkConfig;
use crate::error::CallError;
use crate::error::LinkError;
use crate::error::Result;
use crate::handshake;
use crate::handshake::HandshakeObject;
use crate::hello;
use crate::hello::CopyleftInfo;
use crate::keepalive::KeepAliveMonitor;
use crate::keepalive::Liveness;
use crate::message::Body;
use crate::message::Message;
use crate::message::MessageCode;
use crate::spawner::Spawner;
use crate::transport::Transport;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Handshaking = 1,
    Running = 2,
    Closing = 3,
    Closed = 4,
}

pub type Authorizer = Box<dyn Fn(&Link) -> bool + Send + Sync>;

/// Called once: with the link when it runs, or `None` if it closed first.
pub type ReadyCallback = Box<dyn FnOnce(Option<Link>) + Send>;

/// What the pump expects next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Hello,
    HandshakeRef,
    Envelope,
}

struct State {
    phase: Phase,
    handshake: Option<Arc<HandshakeObject>>,
    handshake_done: bool,
    closing: bool,
    forced: bool,
    peer_license: Option<CopyleftInfo>,
}

enum GatewaySlot {
    Pending,
    Held(RemoteRef),
    Released(WeakRemoteRef),
    Closed,
}

struct KeepAlive {
    send_period: Option<Duration>,
    recv_period: Option<Duration>,
    last_send: Instant,
    monitor: Option<KeepAliveMonitor>,
}

/// Forwards dropped remote proxies to the link's deref task.
struct DerefForwarder(mpsc::UnboundedSender<(u64, u64)>);

impl DerefHook for DerefForwarder {
    fn on_remote_dropped(&self, peer_id: u64, recv_count: u64) {
        // the deref task is gone once the link stopped; nothing left to notify
        let _ = self.0.send((peer_id, recv_count));
    }
}

/// Performs calls that reach this link's proxies from another link.
struct CallRouter(Weak<Inner>);

#[async_trait::async_trait]
impl RemoteCaller for CallRouter {
    async fn call_remote(&self, target: &RemoteRef, args: Vec<Value>) -> CallResult {
        let Some(inner) = self.0.upgrade() else {
            return Err(CallFailure::invalid("link is gone"));
        };
        match inner.call(target, args, CallMode::Normal).await {
            Ok(value) => Ok(value),
            Err(CallError::Exception(value)) => Err(CallFailure::Exception(value)),
            Err(e) => Err(CallFailure::invalid(e.to_string())),
        }
    }
}

pub(crate) struct Inner {
    config: LinkConfig,
    context: Arc<Context>,
    transport: Arc<dyn Transport>,
    spawner: Arc<dyn Spawner>,
    gateway: LocalObject,
    authorizer: Option<Authorizer>,
    authorized: OnceLock<bool>,
    next_msg_id: tokio::sync::Mutex<u64>,
    calls: Arc<PendingCalls>,
    ongoing: watch::Sender<usize>,
    status: watch::Sender<LinkStatus>,
    peer_gateway: watch::Sender<GatewaySlot>,
    /// Stops the pump and background tasks.
    input_halt: watch::Sender<bool>,
    /// Cancels running inbound calls.
    calls_halt: watch::Sender<bool>,
    state: Mutex<State>,
    keep_alive: Mutex<KeepAlive>,
    on_ready: Mutex<Option<ReadyCallback>>,
}

/// A handle to a running session; cheap to clone.
#[derive(Clone)]
pub struct Link {
    inner: Arc<Inner>,
}

impl Link {
    pub(crate) fn start(
        config: LinkConfig,
        transport: Arc<dyn Transport>,
        spawner: Arc<dyn Spawner>,
        gateway: LocalObject,
        authorizer: Option<Authorizer>,
        on_ready: Option<ReadyCallback>,
    ) -> Link {
        let context = Context::with_str_codec(config.str_codec);
        let (deref_tx, deref_rx) = mpsc::unbounded_channel();
        context.set_deref_hook(Arc::new(DerefForwarder(deref_tx)));

        let handshake_timeout = config.handshake_timeout;
        let inner = Arc::new(Inner {
            config,
            context,
            transport,
            spawner,
            gateway,
            authorizer,
            authorized: OnceLock::new(),
            next_msg_id: tokio::sync::Mutex::new(1),
            calls: Arc::new(PendingCalls::default()),
            ongoing: watch::Sender::new(0),
            status: watch::Sender::new(LinkStatus::Handshaking),
            peer_gateway: watch::Sender::new(GatewaySlot::Pending),
            input_halt: watch::Sender::new(false),
            calls_halt: watch::Sender::new(false),
            state: Mutex::new(State {
                phase: Phase::Hello,
                handshake: None,
                handshake_done: false,
                closing: false,
                forced: false,
                peer_license: None,
            }),
            keep_alive: Mutex::new(KeepAlive {
                send_period: None,
                recv_period: None,
                last_send: Instant::now(),
                monitor: None,
            }),
            on_ready: Mutex::new(on_ready),
        });

        inner.context.set_remote_caller(Arc::new(CallRouter(Arc::downgrade(&inner))));

        debug!("link starting");
        inner.spawn(inner.clone().pump());
        inner.spawn(inner.clone().deref_events(deref_rx));
        if let Some(after) = handshake_timeout {
            inner.spawn(inner.clone().handshake_deadline(after));
        }
        Link { inner }
    }

    pub fn status(&self) -> LinkStatus {
        *self.inner.status.borrow()
    }

    /// Receiver that sees every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    /// The id space for references crossing this link.
    pub fn context(&self) -> &Arc<Context> {
        &self.inner.context
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// License terms from the peer hello, once received.
    pub fn peer_license(&self) -> Option<CopyleftInfo> {
        self.inner.state().peer_license.clone()
    }

    /// Whether the authorizer accepted the peer. Runs it at most once.
    pub fn authorize(&self) -> bool {
        self.inner.authorize()
    }

    /// Period we send keep-alives at, as asked for by the peer.
    pub fn keep_alive_send(&self) -> Option<Duration> {
        self.inner.keep_alive().send_period
    }

    /// Period the peer agreed to send at.
    pub fn keep_alive_recv(&self) -> Option<Duration> {
        self.inner.keep_alive().recv_period
    }

    /// Waits for the peer gateway.
    pub async fn peer_gateway(&self, timeout: Option<Duration>) -> Result<RemoteRef> {
        let mut rx = self.inner.peer_gateway.subscribe();
        {
            let ready = rx.wait_for(|slot| !matches!(slot, GatewaySlot::Pending));
            let outcome = match timeout {
                Some(after) => tokio::time::timeout(after, ready)
                    .await
                    .map_err(|_| LinkError::Timeout)?,
                None => ready.await,
            };
            outcome.map_err(|_| LinkError::Closed)?;
        }
        self.inner.extract_peer_gateway()?.ok_or(LinkError::Closed)
    }

    /// The peer gateway if the handshake delivered it already.
    pub fn try_peer_gateway(&self) -> Result<Option<RemoteRef>> {
        self.inner.extract_peer_gateway()
    }

    /// Calls `target` and waits for the outcome.
    pub async fn call(&self, target: &RemoteRef, args: Vec<Value>, mode: CallMode) -> std::result::Result<Value, CallError> {
        self.inner.call(target, args, mode).await
    }

    /// Sends a call and returns without waiting for its reply.
    pub async fn call_pending(
        &self,
        target: &RemoteRef,
        args: Vec<Value>,
        mode: CallMode,
    ) -> std::result::Result<PendingCall, CallError> {
        self.inner.send_call(target, args, mode).await
    }

    /// Starts a shutdown and waits until the link is closed.
    pub async fn shutdown(&self, force: bool) {
        self.inner.request_shutdown(force);
        self.closed().await;
    }

    pub async fn close(&self) {
        self.shutdown(false).await;
    }

    pub async fn closed(&self) {
        let mut rx = self.inner.status.subscribe();
        // an error means the status sender is gone, which is closed as well
        let _ = rx.wait_for(|status| *status == LinkStatus::Closed).await;
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("status", &self.status())
            .field("context", &self.inner.context)
            .finish()
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn keep_alive(&self) -> MutexGuard<'_, KeepAlive> {
        self.keep_alive.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        self.spawner.spawn(Box::pin(task));
    }

    fn handle(self: &Arc<Self>) -> Link {
        Link { inner: self.clone() }
    }

    pub(crate) fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub(crate) fn local_gateway(&self) -> Value {
        Value::from(self.gateway.clone())
    }

    fn authorize(self: &Arc<Self>) -> bool {
        *self.authorized.get_or_init(|| match &self.authorizer {
            Some(authorizer) => authorizer(&self.handle()),
            None => true,
        })
    }

    fn is_closing(&self) -> bool {
        self.state().closing
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Sends a value outside the envelope; only used before the handshake.
    async fn send_value(self: &Arc<Self>, value: &Value) -> Result<()> {
        let _order = self.next_msg_id.lock().await;
        let bytes = Encoder::new(&self.context).encode(value)?;
        self.write(&bytes).await
    }

    async fn send_message(self: &Arc<Self>, code: MessageCode, payload: Value) -> Result<u64> {
        let mut next = self.next_msg_id.lock().await;
        let id = *next;
        let bytes = Encoder::new(&self.context).encode(&Message::envelope(id, code, payload))?;
        *next += 1;
        self.write(&bytes).await?;
        Ok(id)
    }

    pub(crate) async fn send_call(
        self: &Arc<Self>,
        target: &RemoteRef,
        args: Vec<Value>,
        mode: CallMode,
    ) -> std::result::Result<PendingCall, CallError> {
        if self.is_closing() {
            return Err(CallError::Link(LinkError::Closed));
        }
        if !target.is_bound_to(&self.context) {
            return Err(CallError::ForeignTarget);
        }
        let payload = tuple![target.clone(), Value::Tuple(args)];
        let mut next = self.next_msg_id.lock().await;
        let id = *next;
        let bytes = Encoder::new(&self.context).encode(&Message::envelope(id, mode.code(), payload))?;
        *next += 1;
        let pending = match mode {
            CallMode::NoReturn => PendingCall::ready(id, Ok(Value::None)),
            _ => PendingCall::new(id, self.calls.register(id), &self.calls),
        };
        self.write(&bytes).await?;
        trace!(call_id = id, ?mode, "call sent");
        Ok(pending)
    }

    pub(crate) async fn call(
        self: &Arc<Self>,
        target: &RemoteRef,
        args: Vec<Value>,
        mode: CallMode,
    ) -> std::result::Result<Value, CallError> {
        self.send_call(target, args, mode).await?.result().await
    }

    /// Any failed send leaves the stream in an unknown state, so it ends the link.
    async fn write(self: &Arc<Self>, bytes: &[u8]) -> Result<()> {
        match self.transport.send(bytes).await {
            Ok(()) => {
                self.keep_alive().last_send = Instant::now();
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "transport send failed");
                self.abort(LinkError::Transport(e.clone()));
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // Input
    // ========================================================================

    async fn pump(self: Arc<Self>) {
        let mut halt = self.input_halt.subscribe();
        if let Err(e) = self.send_value(&hello::hello(&self.config.copyleft)).await {
            debug!(error = %e, "could not send hello");
            return;
        }

        let mut reader = Reader::with_limits(self.context.clone(), self.config.reader_limits);
        let failure = loop {
            let received = tokio::select! {
                received = self.transport.recv() => received,
                _ = halt.wait_for(|halted| *halted) => return,
            };
            let chunk = match received {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break None,
                Err(e) => break Some(LinkError::Transport(e)),
            };
            if let Err(e) = self.consume(&mut reader, &chunk).await {
                break Some(e);
            }
            if self.is_closing() {
                return;
            }
        };

        match failure {
            None => {
                debug!("peer closed its stream");
                self.request_shutdown(false);
            }
            Some(e) => {
                warn!(error = %e, "link input failed");
                self.abort(e);
            }
        }
    }

    async fn consume(self: &Arc<Self>, reader: &mut Reader, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let consumed = reader.read(data)?;
            data = &data[consumed..];
            if !reader.done() {
                if consumed == 0 {
                    break;
                }
                continue;
            }
            let value = reader.result()?;
            reader.reset();
            self.handle_value(value).await?;
            if self.is_closing() {
                break;
            }
        }
        Ok(())
    }

    async fn handle_value(self: &Arc<Self>, value: Value) -> Result<()> {
        if let Some(monitor) = self.keep_alive().monitor.as_mut() {
            monitor.note_message(Instant::now());
        }
        let phase = self.state().phase;
        match phase {
            Phase::Hello => self.on_hello(value).await,
            Phase::HandshakeRef => self.on_peer_handshake(value),
            Phase::Envelope => self.on_message(Message::parse(value)?).await,
        }
    }

    async fn on_hello(self: &Arc<Self>, value: Value) -> Result<()> {
        let license = hello::parse_hello(value)?;
        debug!(copyleft = license.is_copyleft, "peer hello accepted");
        self.state().peer_license = Some(license);
        if !self.authorize() {
            info!("peer not authorized");
            return Err(LinkError::Handshake("peer not authorized".into()));
        }

        let handshake = Arc::new(HandshakeObject::new(Arc::downgrade(self)));
        {
            let mut state = self.state();
            state.phase = Phase::HandshakeRef;
            state.handshake = Some(handshake.clone());
        }
        let object: Arc<dyn Object> = handshake;
        self.send_value(&Value::from(LocalObject::from_arc(object))).await
    }

    fn on_peer_handshake(self: &Arc<Self>, value: Value) -> Result<()> {
        let Value::Object(ObjectRef::Remote(peer)) = value else {
            return Err(LinkError::Handshake("expected the peer handshake object".into()));
        };
        let handshake = {
            let mut state = self.state();
            state.phase = Phase::Envelope;
            state.handshake.take()
        };
        let Some(handshake) = handshake else {
            return Err(LinkError::Handshake("handshake object missing".into()));
        };
        self.spawn(handshake::run(handshake, self.clone(), peer));
        Ok(())
    }

    async fn on_message(self: &Arc<Self>, message: Message) -> Result<()> {
        match message.body {
            Body::Call { mode, target, args } => self.dispatch_call(message.id, mode, target, args),
            Body::Result { call_id, value } => {
                self.calls.resolve(call_id, Ok(value));
                Ok(())
            }
            Body::Exception { call_id, value } => {
                self.calls.resolve(call_id, Err(CallError::Exception(value)));
                Ok(())
            }
            Body::Error { call_id } => {
                self.calls.resolve(call_id, Err(CallError::Invalid));
                Ok(())
            }
            Body::NotifyDeref { id, recv_count } => self.on_notify_deref(id, recv_count).await,
            Body::ConfirmDeref { id } => {
                let removed = self.context.release_remote(id);
                trace!(peer_id = id, removed, "deref confirmed");
                self.check_idle();
                Ok(())
            }
            Body::KeepAlive => {
                if let Some(monitor) = self.keep_alive().monitor.as_mut() {
                    if let Err(spam) = monitor.note_keep_alive(Instant::now()) {
                        warn!(median = ?spam.median, floor = ?spam.floor, "peer floods keep-alives");
                        return Err(LinkError::ProtocolViolation("keep-alive spam".into()));
                    }
                }
                Ok(())
            }
        }
    }

    // ========================================================================
    // Inbound calls
    // ========================================================================

    fn dispatch_call(
        self: &Arc<Self>,
        call_id: u64,
        mode: CallMode,
        target: ObjectRef,
        args: Vec<Value>,
    ) -> Result<()> {
        let object = match &target {
            ObjectRef::Remote(remote) if remote.is_bound_to(&self.context) => {
                return Err(LinkError::ProtocolViolation("peer called its own object".into()));
            }
            target => self.context.callable_for(target)?,
        };
        trace!(call_id, ?mode, "dispatching call");
        self.ongoing.send_modify(|n| *n += 1);

        let inner = self.clone();
        let mut halt = self.calls_halt.subscribe();
        self.spawn(async move {
            let ctx = CallContext::new(inner.context.clone(), call_id);
            let outcome = tokio::select! {
                outcome = object.object().execute(args, &ctx) => Some(outcome),
                _ = halt.wait_for(|halted| *halted) => None,
            };
            match outcome {
                Some(outcome) => inner.reply(call_id, mode, outcome).await,
                None => debug!(call_id, "call cancelled by shutdown"),
            }
            inner.ongoing.send_modify(|n| *n -= 1);
        });
        Ok(())
    }

    async fn reply(self: &Arc<Self>, call_id: u64, mode: CallMode, outcome: CallResult) {
        let (code, payload) = match (mode, outcome) {
            (CallMode::NoReturn, _) => return,
            (CallMode::VoidResult, Ok(_)) => (MessageCode::CallResult, tuple![call_id, Value::None]),
            (CallMode::Normal, Ok(value)) => (MessageCode::CallResult, tuple![call_id, value]),
            (_, Err(CallFailure::Exception(value))) => (MessageCode::CallException, tuple![call_id, value]),
            (_, Err(CallFailure::Invalid(reason))) => {
                debug!(call_id, %reason, "call could not be performed");
                (MessageCode::CallError, Value::from(call_id))
            }
        };
        let sent = match self.send_message(code, payload).await {
            Err(LinkError::Codec(e)) => {
                debug!(call_id, error = %e, "reply cannot cross the link");
                self.send_message(MessageCode::CallError, Value::from(call_id)).await
            }
            other => other,
        };
        if let Err(e) = sent {
            debug!(call_id, error = %e, "reply not sent");
        }
    }

    // ========================================================================
    // Distributed reference counting
    // ========================================================================

    async fn on_notify_deref(self: &Arc<Self>, id: u64, recv_count: u64) -> Result<()> {
        match self.context.release_local(id, recv_count) {
            Release::Removed => {
                debug!(id, "local object released by peer");
                self.send_message(MessageCode::ConfirmDeref, Value::from(id)).await?;
                self.check_idle();
            }
            Release::CountMismatch { send_count } => {
                debug!(id, recv_count, send_count, "deref raced a send; keeping object");
            }
            Release::Unknown => debug!(id, "deref for unknown object"),
        }
        Ok(())
    }

    async fn deref_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<(u64, u64)>) {
        let mut halt = self.input_halt.subscribe();
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = halt.wait_for(|halted| *halted) => None,
            };
            let Some((peer_id, recv_count)) = event else { break };
            trace!(peer_id, recv_count, "remote proxy dropped");
            let payload = tuple![peer_id, recv_count];
            if self.send_message(MessageCode::NotifyDeref, payload).await.is_err() {
                break;
            }
        }
    }

    /// A running link with no references either way has nothing left to do.
    fn check_idle(self: &Arc<Self>) {
        if self.state().handshake_done && self.context.is_empty() {
            info!("no references left across the link");
            self.request_shutdown(false);
        }
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    pub(crate) fn set_keep_alive_send(&self, period: Duration) {
        self.keep_alive().send_period = Some(period);
    }

    pub(crate) fn set_keep_alive_recv(&self, period: Duration) {
        let mut keep_alive = self.keep_alive();
        keep_alive.recv_period = Some(period);
        keep_alive.monitor = Some(KeepAliveMonitor::new(period, &self.config.keep_alive, Instant::now()));
    }

    pub(crate) fn submit_peer_gateway(&self, gateway: RemoteRef) {
        if self.is_closing() {
            return;
        }
        self.peer_gateway.send_replace(GatewaySlot::Held(gateway));
    }

    fn extract_peer_gateway(&self) -> Result<Option<RemoteRef>> {
        if self.is_closing() {
            return Err(LinkError::Closed);
        }
        let hold = self.config.hold_peer;
        let mut out = Ok(None);
        self.peer_gateway.send_if_modified(|slot| match slot {
            GatewaySlot::Pending => false,
            GatewaySlot::Held(gateway) => {
                let gateway = gateway.clone();
                if !hold {
                    *slot = GatewaySlot::Released(gateway.downgrade());
                }
                out = Ok(Some(gateway));
                !hold
            }
            GatewaySlot::Released(weak) => {
                out = weak.upgrade().map(Some).ok_or(LinkError::NoGateway);
                false
            }
            GatewaySlot::Closed => {
                out = Err(LinkError::Closed);
                false
            }
        });
        out
    }

    pub(crate) fn handshake_completed(self: &Arc<Self>) {
        {
            let mut state = self.state();
            if state.handshake_done || state.closing {
                return;
            }
            state.handshake_done = true;
            self.status.send_replace(LinkStatus::Running);
        }
        info!("link running");
        self.start_keep_alive();
        let on_ready = self.on_ready.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(on_ready) = on_ready {
            on_ready(Some(self.handle()));
        }
    }

    async fn handshake_deadline(self: Arc<Self>, after: Duration) {
        let mut status = self.status.subscribe();
        let settled = status.wait_for(|status| *status != LinkStatus::Handshaking);
        if tokio::time::timeout(after, settled).await.is_err() {
            warn!(?after, "link handshake timed out");
            self.abort(LinkError::Timeout);
        }
    }

    // ========================================================================
    // Keep-alive
    // ========================================================================

    fn start_keep_alive(self: &Arc<Self>) {
        let (send, recv) = {
            let keep_alive = self.keep_alive();
            (keep_alive.send_period, keep_alive.recv_period)
        };
        if let Some(period) = send {
            debug!(?period, "sending keep-alives");
            self.spawn(self.clone().keep_alive_sender(period));
        }
        if recv.is_some() {
            self.spawn(self.clone().keep_alive_watchdog());
        }
    }

    async fn keep_alive_sender(self: Arc<Self>, period: Duration) {
        let mut halt = self.input_halt.subscribe();
        loop {
            let due = self.keep_alive().last_send + period;
            if Instant::now() >= due {
                if self.send_message(MessageCode::KeepAlive, Value::None).await.is_err() {
                    return;
                }
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep_until(due) => {}
                _ = halt.wait_for(|halted| *halted) => return,
            }
        }
    }

    async fn keep_alive_watchdog(self: Arc<Self>) {
        let mut halt = self.input_halt.subscribe();
        loop {
            let liveness = match self.keep_alive().monitor.as_ref() {
                Some(monitor) => monitor.check(Instant::now()),
                None => return,
            };
            let recheck_in = match liveness {
                Liveness::Alive { recheck_in } => recheck_in,
                Liveness::Expired { silent } => {
                    warn!(?silent, "peer keep-alive expired");
                    self.abort(LinkError::Timeout);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(recheck_in) => {}
                _ = halt.wait_for(|halted| *halted) => return,
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    pub(crate) fn abort(self: &Arc<Self>, reason: LinkError) {
        debug!(%reason, "aborting link");
        self.request_shutdown(true);
    }

    /// Starts closing; later requests can only escalate to forced.
    pub(crate) fn request_shutdown(self: &Arc<Self>, force: bool) {
        let force = {
            let mut state = self.state();
            if state.closing {
                if force && !state.forced {
                    state.forced = true;
                    drop(state);
                    info!("link shutdown escalated to forced");
                    self.calls_halt.send_replace(true);
                }
                return;
            }
            state.closing = true;
            // a half-done handshake has nothing worth draining
            state.forced = force || !state.handshake_done;
            self.status.send_replace(LinkStatus::Closing);
            state.forced
        };
        info!(force, "link closing");

        self.input_halt.send_replace(true);
        self.calls.fail_all(CallError::Link(LinkError::Closed));
        if force {
            self.calls_halt.send_replace(true);
        }
        self.spawn(self.clone().finish_shutdown());
    }

    async fn finish_shutdown(self: Arc<Self>) {
        let mut ongoing = self.ongoing.subscribe();
        let drained = ongoing.wait_for(|n| *n == 0);
        match self.config.force_timeout {
            Some(after) => {
                if tokio::time::timeout(after, drained).await.is_err() {
                    warn!(?after, "calls did not drain; forcing shutdown");
                    self.request_shutdown(true);
                    let _ = ongoing.wait_for(|n| *n == 0).await;
                }
            }
            None => {
                let _ = drained.await;
            }
        }

        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "closing transport failed");
        }
        self.finalize();
    }

    fn finalize(self: &Arc<Self>) {
        self.context.clear_deref_hook();
        self.context.clear_remote_caller();
        self.calls_halt.send_replace(true);
        let gateway = self.peer_gateway.send_replace(GatewaySlot::Closed);
        drop(gateway);
        self.state().handshake = None;
        if self.config.purge {
            self.context.purge();
        }
        self.status.send_replace(LinkStatus::Closed);
        info!("link closed");

        let on_ready = self.on_ready.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(on_ready) = on_ready {
            on_ready(None);
        }
    }
}
