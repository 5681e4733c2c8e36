#![allow(dead_code)]

use std::time::Duration;

use anyhow::Context as _;
use tracing_subscriber::EnvFilter;

use orbpack::CallContext;
use orbpack::CallFailure;
use orbpack::CallResult;
use orbpack::LocalObject;
use orbpack::Object;
use orbpack::Value;
use orblink::DuplexChannelTransport;
use orblink::Link;
use orblink::LinkConfig;
use orblink::LinkStatus;

pub type R<T> = anyhow::Result<T>;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Gateway used across the link tests.
///
/// - `("add", a, b)` returns `a + b`
/// - `("div", a, b)` raises on division by zero
/// - `("make",)` returns a fresh object
/// - `("echo", value)` returns `value`
/// - `("sleep", ms)` returns `ms` after sleeping that long
/// - `("hang",)` never returns
pub struct Calculator;

#[async_trait::async_trait]
impl Object for Calculator {
    async fn execute(&self, args: Vec<Value>, _ctx: &CallContext) -> CallResult {
        match args.as_slice() {
            [Value::Utf(m), a, b] if m == "add" => match (a.as_int(), b.as_int()) {
                (Some(a), Some(b)) => Ok(Value::Int(a + b)),
                _ => Err(CallFailure::exception(vec![Value::from("add needs integers")])),
            },
            [Value::Utf(m), a, b] if m == "div" => match (a.as_i64(), b.as_i64()) {
                (Some(_), Some(0)) => Err(CallFailure::exception(vec![Value::from("division by zero")])),
                (Some(a), Some(b)) => Ok(Value::from(a / b)),
                _ => Err(CallFailure::invalid("div needs integers")),
            },
            [Value::Utf(m)] if m == "make" => Ok(Value::from(LocalObject::new(Calculator))),
            [Value::Utf(m), value] if m == "echo" => Ok(value.clone()),
            [Value::Utf(m), ms] if m == "sleep" => {
                let ms = ms.as_u64().ok_or_else(|| CallFailure::invalid("sleep needs a duration"))?;
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(Value::from(ms))
            }
            [Value::Utf(m)] if m == "hang" => std::future::pending().await,
            _ => Err(CallFailure::invalid("no such method")),
        }
    }
}

pub fn args(items: Value) -> Vec<Value> {
    items.into_tuple().unwrap_or_default()
}

/// Two links joined by an in-memory channel, both serving a `Calculator`.
pub fn pair(config_a: LinkConfig, config_b: LinkConfig) -> (Link, Link) {
    let (ta, tb) = DuplexChannelTransport::pair();
    let a = Link::builder()
        .config(config_a)
        .gateway(LocalObject::new(Calculator))
        .start(ta);
    let b = Link::builder()
        .config(config_b)
        .gateway(LocalObject::new(Calculator))
        .start(tb);
    (a, b)
}

pub async fn wait_status(link: &Link, status: LinkStatus) -> R<()> {
    let mut rx = link.subscribe_status();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == status))
        .await
        .with_context(|| format!("link never reached {:?}", status))??;
    Ok(())
}

pub async fn running(links: &[&Link]) -> R<()> {
    for link in links {
        wait_status(link, LinkStatus::Running).await?;
    }
    Ok(())
}

/// Polls `cond` until it holds or the wait runs out.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> R<()> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}
