//! # Call-Execute Contract
//!
//! What a callable object looks like to a link. Publishing conveniences
//! (method tables, argument conversion) live above this trait.

use std::sync::Arc;

use crate::context::Context;
use crate::value::RemoteRef;
use crate::value::Value;

/// Why a call did not produce a result.
#[derive(Debug, Clone, PartialEq)]
pub enum CallFailure {
    /// The invocation itself could not be dispatched (unknown method, bad arity).
    Invalid(String),
    /// The callee raised an error, carried as a value.
    Exception(Value),
}

impl CallFailure {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }

    /// An exception value built from `args`.
    pub fn exception(args: Vec<Value>) -> Self {
        Self::Exception(Value::Exception(args))
    }

    /// Best-effort conversion of an arbitrary error into an exception value.
    pub fn from_error(err: &dyn std::error::Error) -> Self {
        Self::Exception(Value::Exception(vec![Value::Utf(err.to_string())]))
    }
}

impl std::fmt::Display for CallFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid(msg) => write!(f, "Invalid call: {}", msg),
            Self::Exception(value) => write!(f, "Call raised: {:?}", value),
        }
    }
}

impl std::error::Error for CallFailure {}

pub type CallResult = std::result::Result<Value, CallFailure>;

/// Where a call came from.
#[derive(Clone)]
pub struct CallContext {
    context: Arc<Context>,
    call_id: u64,
}

impl CallContext {
    pub fn new(context: Arc<Context>, call_id: u64) -> Self {
        Self { context, call_id }
    }

    /// The id space of the link the call arrived on.
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn call_id(&self) -> u64 {
        self.call_id
    }
}

/// An object that can be called through a link.
///
/// `args` is the call's argument tuple; by convention its first element
/// names the method.
#[async_trait::async_trait]
pub trait Object: Send + Sync + 'static {
    async fn execute(&self, args: Vec<Value>, ctx: &CallContext) -> CallResult;
}

/// Performs calls on the proxies of one context, usually through its link.
#[async_trait::async_trait]
pub trait RemoteCaller: Send + Sync + 'static {
    async fn call_remote(&self, target: &RemoteRef, args: Vec<Value>) -> CallResult;
}

/// Stands in for a proxy of another context when it is passed on.
///
/// Calls go to the proxy's own context and its caller. Holding the proxy
/// keeps the far object alive while this side's peer references it.
pub(crate) struct Forward {
    target: RemoteRef,
}

impl Forward {
    pub(crate) fn new(target: RemoteRef) -> Self {
        Self { target }
    }
}

#[async_trait::async_trait]
impl Object for Forward {
    async fn execute(&self, args: Vec<Value>, _ctx: &CallContext) -> CallResult {
        let caller = self
            .target
            .context()
            .and_then(|context| context.remote_caller())
            .ok_or_else(|| CallFailure::invalid("forwarded reference is unreachable"))?;
        caller.call_remote(&self.target, args).await
    }
}

/// An object that rejects every call. Used as the default gateway.
pub struct EmptyObject;

#[async_trait::async_trait]
impl Object for EmptyObject {
    async fn execute(&self, _args: Vec<Value>, _ctx: &CallContext) -> CallResult {
        Err(CallFailure::invalid("object exposes no methods"))
    }
}
