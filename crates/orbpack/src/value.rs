//! # Values
//!
//! The closed set of wire-representable types.
//!
//! ## Invariants
//!
//! - Values are immutable once built and compare structurally.
//! - `ObjectRef` is the exception: two references are equal only when they
//!   name the same object.
//! - A `RemoteRef` is bound to the `Context` that minted it and means
//!   nothing outside it.

use std::fmt;
use std::sync::Arc;
use std::sync::Weak;

use num_bigint::BigInt;
use num_traits::ToPrimitive;
use num_traits::Zero;

use crate::context::Context;
use crate::object::Object;
use crate::types::Error;
use crate::types::Result;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(BigInt),
    Bool(bool),
    None,
    Float(Float),
    Bytes(Vec<u8>),
    Utf(String),
    Tuple(Vec<Value>),
    /// Argument list of an error raised by a callee.
    Exception(Vec<Value>),
    /// A value with an ordered tag list, interpreted by higher layers.
    Tagged(Box<Value>, Vec<Value>),
    Object(ObjectRef),
}

impl Value {
    pub fn tuple<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Value>,
    {
        Value::Tuple(items.into_iter().map(Into::into).collect())
    }

    pub fn tagged(value: impl Into<Value>, tags: Vec<Value>) -> Self {
        Value::Tagged(Box::new(value.into()), tags)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_int(&self) -> Option<&BigInt> {
        match self {
            Value::Int(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_int().and_then(ToPrimitive::to_i64)
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.as_int().and_then(ToPrimitive::to_u64)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Utf(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_tuple(self) -> Option<Vec<Value>> {
        match self {
            Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(n: $t) -> Self {
                    Value::Int(BigInt::from(n))
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, i128, u8, u16, u32, u64, u128, usize);

impl From<BigInt> for Value {
    fn from(n: BigInt) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::None
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Utf(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Utf(s)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Tuple(items)
    }
}

impl From<Float> for Value {
    fn from(f: Float) -> Self {
        Value::Float(f)
    }
}

impl From<ObjectRef> for Value {
    fn from(obj: ObjectRef) -> Self {
        Value::Object(obj)
    }
}

impl From<LocalObject> for Value {
    fn from(obj: LocalObject) -> Self {
        Value::Object(ObjectRef::Local(obj))
    }
}

impl From<RemoteRef> for Value {
    fn from(obj: RemoteRef) -> Self {
        Value::Object(ObjectRef::Remote(obj))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::None, Into::into)
    }
}

// ============================================================================
// Floats
// ============================================================================

/// A number `digits * base^exp` in an arbitrary base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Float {
    digits: BigInt,
    base: BigInt,
    exp: BigInt,
}

impl Float {
    pub fn new(digits: BigInt, base: BigInt, exp: BigInt) -> Result<Self> {
        if base < BigInt::from(2) {
            return Err(Error::InvalidFloatBase);
        }
        Ok(Self { digits, base, exp })
    }

    pub fn base2(digits: impl Into<BigInt>, exp: impl Into<BigInt>) -> Self {
        Self { digits: digits.into(), base: BigInt::from(2), exp: exp.into() }
    }

    pub fn base10(digits: impl Into<BigInt>, exp: impl Into<BigInt>) -> Self {
        Self { digits: digits.into(), base: BigInt::from(10), exp: exp.into() }
    }

    pub fn digits(&self) -> &BigInt {
        &self.digits
    }

    pub fn base(&self) -> &BigInt {
        &self.base
    }

    pub fn exp(&self) -> &BigInt {
        &self.exp
    }

    /// Exact base-2 form of a finite `f64`; `None` for NaN and infinities.
    pub fn from_f64(x: f64) -> Option<Self> {
        if !x.is_finite() {
            return None;
        }
        if x == 0.0 {
            return Some(Self::base2(0, 0));
        }
        let bits = x.to_bits();
        let negative = bits >> 63 == 1;
        let biased = ((bits >> 52) & 0x7FF) as i64;
        let fraction = bits & ((1u64 << 52) - 1);
        let (mut mantissa, mut exp) = if biased == 0 {
            (fraction, -1074)
        } else {
            (fraction | (1u64 << 52), biased - 1075)
        };
        let shift = mantissa.trailing_zeros();
        mantissa >>= shift;
        exp += shift as i64;
        let digits = if negative { -BigInt::from(mantissa) } else { BigInt::from(mantissa) };
        Some(Self::base2(digits, exp))
    }

    /// Native value for base 2 and base 10; other bases return `None`.
    pub fn to_f64(&self) -> Option<f64> {
        if self.base == BigInt::from(2) {
            let digits = self.digits.to_f64()?;
            let exp = self.exp.to_i32()?;
            let half = exp / 2;
            Some(digits * 2f64.powi(half) * 2f64.powi(exp - half))
        } else if self.base == BigInt::from(10) {
            format!("{}e{}", self.digits, self.exp).parse().ok()
        } else {
            None
        }
    }

    pub fn is_zero(&self) -> bool {
        self.digits.is_zero()
    }
}

// ============================================================================
// Object references
// ============================================================================

/// An object owned by this process, compared by identity.
#[derive(Clone)]
pub struct LocalObject(Arc<dyn Object>);

impl LocalObject {
    pub fn new(object: impl Object) -> Self {
        Self(Arc::new(object))
    }

    pub fn from_arc(object: Arc<dyn Object>) -> Self {
        Self(object)
    }

    pub fn object(&self) -> &Arc<dyn Object> {
        &self.0
    }

    /// Identity key, stable while any clone is alive.
    pub fn key(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn ptr_eq(&self, other: &LocalObject) -> bool {
        self.key() == other.key()
    }
}

impl PartialEq for LocalObject {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for LocalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalObject({:#x})", self.key())
    }
}

pub(crate) struct RemoteHandle {
    pub(crate) peer_id: u64,
    pub(crate) context: Weak<Context>,
}

impl Drop for RemoteHandle {
    fn drop(&mut self) {
        if let Some(context) = self.context.upgrade() {
            context.remote_dropped(self.peer_id, self as *const RemoteHandle);
        }
    }
}

/// Proxy for an object owned by the peer.
///
/// Clones share one handle. When the last clone is dropped the owning
/// context is told, which lets the link start a dereference.
#[derive(Clone)]
pub struct RemoteRef {
    pub(crate) handle: Arc<RemoteHandle>,
}

impl RemoteRef {
    pub fn peer_id(&self) -> u64 {
        self.handle.peer_id
    }

    pub fn context(&self) -> Option<Arc<Context>> {
        self.handle.context.upgrade()
    }

    pub fn is_bound_to(&self, context: &Context) -> bool {
        std::ptr::eq(self.handle.context.as_ptr(), context)
    }

    pub fn ptr_eq(&self, other: &RemoteRef) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }

    /// Identity key, stable while any clone is alive.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.handle) as usize
    }

    pub fn downgrade(&self) -> WeakRemoteRef {
        WeakRemoteRef(Arc::downgrade(&self.handle))
    }
}

impl PartialEq for RemoteRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl fmt::Debug for RemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteRef({})", self.peer_id())
    }
}

/// A remote reference that does not keep the proxy alive.
#[derive(Clone, Default)]
pub struct WeakRemoteRef(Weak<RemoteHandle>);

impl WeakRemoteRef {
    pub fn upgrade(&self) -> Option<RemoteRef> {
        self.0.upgrade().map(|handle| RemoteRef { handle })
    }
}

impl fmt::Debug for WeakRemoteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WeakRemoteRef")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectRef {
    Local(LocalObject),
    Remote(RemoteRef),
}

impl ObjectRef {
    pub fn as_local(&self) -> Option<&LocalObject> {
        match self {
            ObjectRef::Local(obj) => Some(obj),
            ObjectRef::Remote(_) => None,
        }
    }

    pub fn as_remote(&self) -> Option<&RemoteRef> {
        match self {
            ObjectRef::Remote(obj) => Some(obj),
            ObjectRef::Local(_) => None,
        }
    }
}
