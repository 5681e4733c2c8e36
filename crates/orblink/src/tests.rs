//! Wire-level tests: a link against a peer that speaks the protocol by hand.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use anyhow::bail;
use anyhow::ensure;

use orbpack::CallContext;
use orbpack::CallFailure;
use orbpack::CallResult;
use orbpack::Context;
use orbpack::EmptyObject;
use orbpack::LocalObject;
use orbpack::Object;
use orbpack::ObjectRef;
use orbpack::Reader;
use orbpack::RemoteRef;
use orbpack::Value;
use orbpack::encode;
use orbpack::tuple;

use crate::builder::LinkBuilder;
use crate::config::KeepAliveConfig;
use crate::config::LinkConfig;
use crate::hello;
use crate::hello::CopyleftInfo;
use crate::link::Link;
use crate::link::LinkStatus;
use crate::message::Body;
use crate::message::Message;
use crate::message::MessageCode;
use crate::mock_transport::DuplexChannelTransport;
use crate::transport::Transport;

type R<T> = anyhow::Result<T>;

const WAIT: Duration = Duration::from_secs(5);

struct Adder;

#[async_trait::async_trait]
impl Object for Adder {
    async fn execute(&self, args: Vec<Value>, _ctx: &CallContext) -> CallResult {
        match args.as_slice() {
            [Value::Utf(m), a, b] if m == "add" => match (a.as_int(), b.as_int()) {
                (Some(a), Some(b)) => Ok(Value::Int(a + b)),
                _ => Err(CallFailure::exception(vec![Value::from("add needs integers")])),
            },
            _ => Err(CallFailure::invalid("no such method")),
        }
    }
}

/// The far end of a link, driven step by step.
struct RawPeer {
    transport: DuplexChannelTransport,
    context: Arc<Context>,
    reader: Reader,
    buffered: Vec<u8>,
    next_id: u64,
    handshake: LocalObject,
    gateway: LocalObject,
    /// Granted when the link asks for keep-alives.
    grant: Option<u64>,
}

impl RawPeer {
    fn new(transport: DuplexChannelTransport) -> Self {
        let context = Context::new();
        Self {
            transport,
            reader: Reader::new(context.clone()),
            context,
            buffered: Vec::new(),
            next_id: 1,
            handshake: LocalObject::new(EmptyObject),
            gateway: LocalObject::new(EmptyObject),
            grant: None,
        }
    }

    async fn send(&self, value: &Value) -> R<()> {
        let bytes = encode(value, &self.context)?;
        self.transport.send(&bytes).await?;
        Ok(())
    }

    async fn message(&mut self, code: MessageCode, payload: Value) -> R<u64> {
        let id = self.next_id;
        self.next_id += 1;
        self.send(&Message::envelope(id, code, payload)).await?;
        Ok(id)
    }

    async fn recv(&mut self) -> R<Option<Value>> {
        loop {
            if !self.buffered.is_empty() {
                let consumed = self.reader.read(&self.buffered)?;
                self.buffered.drain(..consumed);
                if self.reader.done() {
                    let value = self.reader.result()?;
                    self.reader.reset();
                    return Ok(Some(value));
                }
            }
            match tokio::time::timeout(WAIT, self.transport.recv()).await?? {
                Some(chunk) => self.buffered.extend(chunk),
                None => return Ok(None),
            }
        }
    }

    async fn recv_message(&mut self) -> R<Message> {
        let value = self.recv().await?.context("stream ended")?;
        Ok(Message::parse(value)?)
    }

    /// Skips unrelated traffic until `call_id` is answered.
    async fn reply_to(&mut self, call_id: u64) -> R<Body> {
        loop {
            let message = self.recv_message().await?;
            let answers = matches!(
                &message.body,
                Body::Result { call_id: id, .. }
                    | Body::Exception { call_id: id, .. }
                    | Body::Error { call_id: id }
                    if *id == call_id
            );
            if answers {
                return Ok(message.body);
            }
        }
    }

    /// Runs the peer side of the handshake; returns the link's handshake
    /// object and gateway.
    async fn handshake(&mut self) -> R<(RemoteRef, RemoteRef)> {
        let hello = self.recv().await?.context("no hello")?;
        hello::parse_hello(hello)?;
        self.send(&hello::hello(&CopyleftInfo::default())).await?;

        let link_handshake = match self.recv().await? {
            Some(Value::Object(ObjectRef::Remote(remote))) => remote,
            other => bail!("expected the handshake object, got {:?}", other),
        };
        self.send(&Value::from(self.handshake.clone())).await?;
        let finish = self
            .message(MessageCode::MethodCall, tuple![link_handshake.clone(), tuple!["finish"]])
            .await?;

        let mut gateway = None;
        let mut answered = false;
        while gateway.is_none() || !answered {
            let message = self.recv_message().await?;
            match message.body {
                Body::Call { target, args, .. } => {
                    ensure!(target.as_local().is_some_and(|t| t.ptr_eq(&self.handshake)));
                    let reply = match args.as_slice() {
                        [Value::Utf(m), period] if m == "keep_alive" => {
                            let granted = self.grant.or(period.as_u64()).context("bad period")?;
                            Value::from(granted)
                        }
                        [Value::Utf(m)] if m == "finish" => {
                            answered = true;
                            Value::from(self.gateway.clone())
                        }
                        _ => bail!("unexpected handshake call {:?}", args),
                    };
                    self.message(MessageCode::CallResult, tuple![message.id, reply]).await?;
                }
                Body::Result { call_id, value: Value::Object(ObjectRef::Remote(gw)) } if call_id == finish => {
                    gateway = Some(gw);
                }
                other => bail!("unexpected message {:?}", other),
            }
        }
        let gateway = gateway.context("no gateway")?;
        Ok((link_handshake, gateway))
    }
}

fn start(config: LinkConfig) -> (Link, RawPeer) {
    let (ta, tb) = DuplexChannelTransport::pair();
    let link = LinkBuilder::new()
        .config(config)
        .gateway(LocalObject::new(Adder))
        .start(ta);
    (link, RawPeer::new(tb))
}

async fn wait_status(link: &Link, status: LinkStatus) -> R<()> {
    let mut rx = link.subscribe_status();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == status))
        .await
        .with_context(|| format!("link never reached {:?}", status))??;
    Ok(())
}

// ============================================================================
// Calls on the wire
// ============================================================================

#[tokio::test]
async fn test_call_result_on_wire() -> R<()> {
    let (link, mut raw) = start(LinkConfig::default());
    let (_hs, gw) = raw.handshake().await?;
    wait_status(&link, LinkStatus::Running).await?;

    let call = raw.message(MessageCode::MethodCall, tuple![gw.clone(), tuple!["add", 7, 3]]).await?;
    match raw.reply_to(call).await? {
        Body::Result { value, .. } => assert_eq!(value, Value::from(10)),
        other => bail!("expected a result, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_unknown_method_is_call_error_on_wire() -> R<()> {
    let (link, mut raw) = start(LinkConfig::default());
    let (_hs, gw) = raw.handshake().await?;
    wait_status(&link, LinkStatus::Running).await?;

    let call = raw.message(MessageCode::MethodCall, tuple![gw.clone(), tuple!["mul", 7, 3]]).await?;
    assert!(matches!(raw.reply_to(call).await?, Body::Error { .. }));

    let call = raw.message(MessageCode::MethodCall, tuple![gw.clone(), tuple!["add", "x", 3]]).await?;
    assert!(matches!(raw.reply_to(call).await?, Body::Exception { value: Value::Exception(_), .. }));
    assert_eq!(link.status(), LinkStatus::Running);
    Ok(())
}

#[tokio::test]
async fn test_void_result_sends_none() -> R<()> {
    let (link, mut raw) = start(LinkConfig::default());
    let (_hs, gw) = raw.handshake().await?;
    wait_status(&link, LinkStatus::Running).await?;

    let call = raw
        .message(MessageCode::MethodCallVoidResult, tuple![gw.clone(), tuple!["add", 1, 1]])
        .await?;
    match raw.reply_to(call).await? {
        Body::Result { value, .. } => assert!(value.is_none()),
        other => bail!("expected a result, got {:?}", other),
    }
    Ok(())
}

// ============================================================================
// Reference counting on the wire
// ============================================================================

#[tokio::test]
async fn test_deref_needs_matching_count() -> R<()> {
    let (link, mut raw) = start(LinkConfig::default());
    let (_hs, gw) = raw.handshake().await?;
    wait_status(&link, LinkStatus::Running).await?;

    let id = gw.peer_id();
    assert_eq!(link.context().local_send_count(id), Some(1));
    // the link answered finish once; a stale count keeps the object
    raw.message(MessageCode::NotifyDeref, tuple![id, 0]).await?;
    let probe = raw.message(MessageCode::MethodCall, tuple![gw.clone(), tuple!["add", 1, 1]]).await?;
    assert!(matches!(raw.reply_to(probe).await?, Body::Result { .. }));
    assert_eq!(link.context().local_send_count(id), Some(1));

    raw.message(MessageCode::NotifyDeref, tuple![id, 1]).await?;
    loop {
        let message = raw.recv_message().await?;
        if let Body::ConfirmDeref { id: confirmed } = message.body {
            assert_eq!(confirmed, id);
            break;
        }
    }
    assert_eq!(link.context().local_send_count(id), None);
    Ok(())
}

#[tokio::test]
async fn test_dropped_proxy_sends_notify() -> R<()> {
    let (link, mut raw) = start(LinkConfig::default());
    let (_hs, _gw) = raw.handshake().await?;
    wait_status(&link, LinkStatus::Running).await?;

    // once running, the link lets go of the raw peer's handshake object
    let expected = raw.context.local_id_for(&ObjectRef::Local(raw.handshake.clone()), false)?;
    loop {
        let message = raw.recv_message().await?;
        if let Body::NotifyDeref { id, recv_count } = message.body {
            assert_eq!(id, expected);
            assert_eq!(recv_count, 1);
            break;
        }
    }
    Ok(())
}

// ============================================================================
// Protocol violations
// ============================================================================

#[tokio::test]
async fn test_double_finish_closes_link() -> R<()> {
    let (link, mut raw) = start(LinkConfig::default());
    let (hs, _gw) = raw.handshake().await?;
    wait_status(&link, LinkStatus::Running).await?;

    raw.message(MessageCode::MethodCall, tuple![hs.clone(), tuple!["finish"]]).await?;
    wait_status(&link, LinkStatus::Closed).await?;
    Ok(())
}

#[tokio::test]
async fn test_loop_back_call_closes_link() -> R<()> {
    let (link, mut raw) = start(LinkConfig::default());
    raw.handshake().await?;
    wait_status(&link, LinkStatus::Running).await?;

    let own = raw.gateway.clone();
    raw.message(MessageCode::MethodCall, tuple![own, tuple!["add", 1, 1]]).await?;
    wait_status(&link, LinkStatus::Closed).await?;
    Ok(())
}

#[tokio::test]
async fn test_unknown_code_closes_link() -> R<()> {
    let (link, mut raw) = start(LinkConfig::default());
    raw.handshake().await?;
    wait_status(&link, LinkStatus::Running).await?;

    raw.send(&tuple![99, 42, Value::None]).await?;
    wait_status(&link, LinkStatus::Closed).await?;
    Ok(())
}

#[tokio::test]
async fn test_garbage_hello_closes_link() -> R<()> {
    let (link, raw) = start(LinkConfig::default());
    raw.send(&tuple![&b"NOT_VOL"[..], tuple![false, Value::None, Value::None], tuple![0, 8]]).await?;
    wait_status(&link, LinkStatus::Closed).await?;
    assert_eq!(link.peer_license(), None);
    Ok(())
}

// ============================================================================
// Keep-alive
// ============================================================================

fn keep_alive_config(period_ms: u64) -> LinkConfig {
    LinkConfig {
        keep_alive: KeepAliveConfig::default().with_request(Duration::from_millis(period_ms)),
        ..LinkConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_expires() -> R<()> {
    let (link, mut raw) = start(keep_alive_config(100));
    raw.handshake().await?;
    wait_status(&link, LinkStatus::Running).await?;
    assert_eq!(link.keep_alive_recv(), Some(Duration::from_millis(100)));

    let started = tokio::time::Instant::now();
    wait_status(&link, LinkStatus::Closed).await?;
    // expiry is 1.5 periods after the last message
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(140), "closed after {:?}", elapsed);
    assert!(elapsed <= Duration::from_millis(200), "closed after {:?}", elapsed);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_keep_alives_hold_link_open() -> R<()> {
    let (link, mut raw) = start(keep_alive_config(100));
    raw.handshake().await?;
    wait_status(&link, LinkStatus::Running).await?;

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        raw.message(MessageCode::KeepAlive, Value::None).await?;
    }
    tokio::task::yield_now().await;
    assert_eq!(link.status(), LinkStatus::Running);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_spam_closes_link() -> R<()> {
    let (link, mut raw) = start(keep_alive_config(100));
    raw.handshake().await?;
    wait_status(&link, LinkStatus::Running).await?;

    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(1)).await;
        raw.message(MessageCode::KeepAlive, Value::None).await?;
    }
    wait_status(&link, LinkStatus::Closed).await?;
    Ok(())
}

#[tokio::test]
async fn test_short_grant_fails_handshake() -> R<()> {
    let (link, mut raw) = start(keep_alive_config(1000));
    raw.grant = Some(500);
    // the link rejects the grant instead of finishing, so the exchange stalls
    let _ = tokio::time::timeout(Duration::from_millis(500), raw.handshake()).await;
    wait_status(&link, LinkStatus::Closed).await?;
    Ok(())
}
