//! Per-variant decoders driven by the `Reader`.
//!
//! A decoder goes through four steps: header, embedded children, payload,
//! result. Each step may stop short when input runs out and continue on the
//! next chunk.

use num_bigint::BigInt;
use num_bigint::BigUint;
use num_traits::ToPrimitive;

use crate::context::Context;
use crate::cursor::Cursor;
use crate::strcodec::StrCodec;
use crate::types::Error;
use crate::types::PACKED_MAX;
use crate::types::Result;
use crate::types::START;
use crate::types::Tag;
use crate::value::Float;
use crate::value::ObjectRef;
use crate::value::Value;
use crate::varint;
use crate::varint::VarintReader;

// Caps the up-front allocation for a declared byte length.
const MAX_PREALLOC: usize = 1 << 16;

/// What kind of decoder a parent asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    /// An explicit value, starting with its tag byte.
    Entity,
    /// An implicit signed integer.
    Int,
    /// Implicit bytes: length header plus raw payload.
    Bytes,
    /// An implicit tuple: count header plus explicit members.
    Tuple,
}

/// The embedded decoders a parent needs, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Children {
    kind: Kind,
    remaining: usize,
}

impl Children {
    fn new(kind: Kind, count: usize) -> Self {
        Self { kind, remaining: count }
    }

    /// A single explicit value, the root of every read.
    pub(crate) fn top() -> Self {
        Self::new(Kind::Entity, 1)
    }

    fn none() -> Self {
        Self::new(Kind::Entity, 0)
    }

    pub(crate) fn len(&self) -> usize {
        self.remaining
    }
}

impl Iterator for Children {
    type Item = Kind;

    fn next(&mut self) -> Option<Kind> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.kind)
    }
}

/// Progress report from `decode_header`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) done: bool,
    /// Embedded values known to be required so far.
    pub(crate) min_objects: usize,
    /// Payload bytes known to be required so far.
    pub(crate) min_payload: usize,
}

impl Header {
    fn pending() -> Self {
        Self { done: false, min_objects: 0, min_payload: 0 }
    }

    fn done(min_objects: usize, min_payload: usize) -> Self {
        Self { done: true, min_objects, min_payload }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IntForm {
    /// Implicit, sign folded into the low bit.
    Signed,
    /// After `IntPos`: distance above the packed range.
    Above,
    /// After `IntNeg`: distance below -1.
    Below,
}

impl IntForm {
    fn apply(self, n: BigUint) -> BigInt {
        match self {
            IntForm::Signed => varint::posint_to_signed(n),
            IntForm::Above => BigInt::from(n) + (PACKED_MAX + 1),
            IntForm::Below => -BigInt::from(n) - 2,
        }
    }
}

#[derive(Debug)]
enum State {
    /// Waiting for the tag byte of an explicit value.
    Entity,
    /// Fully known from its tag byte.
    Scalar,
    Int(IntForm, VarintReader),
    Bytes { len: VarintReader, remaining: Option<usize>, data: Vec<u8> },
    Tuple { len: VarintReader, count: Option<usize> },
    Str { named: bool },
    /// Exception or tagged value around one implicit tuple.
    Wrap(Tag),
    Float(Tag),
    Ref(Tag),
}

#[derive(Debug)]
pub(crate) struct Decoder {
    state: State,
    limit: Option<usize>,
    result: Option<Value>,
}

impl Decoder {
    /// `limit` bounds the encoded size of any integer or length.
    pub(crate) fn new(kind: Kind, limit: Option<usize>) -> Self {
        let state = match kind {
            Kind::Entity => State::Entity,
            Kind::Int => State::Int(IntForm::Signed, VarintReader::new(limit)),
            Kind::Bytes => State::Bytes { len: VarintReader::new(limit), remaining: None, data: Vec::new() },
            Kind::Tuple => State::Tuple { len: VarintReader::new(limit), count: None },
        };
        Self { state, limit, result: None }
    }

    pub(crate) fn decode_header(&mut self, cur: &mut Cursor<'_>) -> Result<Header> {
        if let State::Entity = self.state {
            let Some(byte) = cur.read_byte() else {
                return Ok(Header::pending());
            };
            self.state = self.dispatch(byte)?;
        }

        let header = match &mut self.state {
            State::Entity | State::Scalar => Header::done(0, 0),
            State::Int(form, reader) => match reader.feed(cur)? {
                Some(n) => {
                    self.result = Some(Value::Int(form.apply(n)));
                    Header::done(0, 0)
                }
                None => Header::pending(),
            },
            State::Bytes { len, remaining, data } => match remaining {
                Some(n) => Header::done(0, *n),
                None => match len.feed(cur)? {
                    Some(n) => {
                        let n = varint::to_len(&n)?;
                        *remaining = Some(n);
                        data.reserve(n.min(MAX_PREALLOC));
                        Header::done(0, n)
                    }
                    None => Header::pending(),
                },
            },
            State::Tuple { len, count } => match count {
                Some(n) => Header::done(*n, 0),
                None => match len.feed(cur)? {
                    Some(n) => {
                        let n = varint::to_len(&n)?;
                        *count = Some(n);
                        Header::done(n, 0)
                    }
                    None => Header::pending(),
                },
            },
            State::Str { named: true } => Header::done(2, 0),
            State::Str { named: false } => Header::done(1, 0),
            State::Wrap(_) | State::Ref(_) => Header::done(1, 0),
            State::Float(Tag::FloatN) => Header::done(3, 0),
            State::Float(_) => Header::done(2, 0),
        };
        Ok(header)
    }

    fn dispatch(&mut self, byte: u8) -> Result<State> {
        if byte < START {
            self.result = Some(Value::Int(BigInt::from(byte as i64 - 1)));
            return Ok(State::Scalar);
        }
        let tag = Tag::from_u8(byte).ok_or(Error::UnknownTag(byte))?;
        let state = match tag {
            Tag::IntPos => State::Int(IntForm::Above, VarintReader::new(self.limit)),
            Tag::IntNeg => State::Int(IntForm::Below, VarintReader::new(self.limit)),
            Tag::False | Tag::True | Tag::None => {
                self.result = Some(match tag {
                    Tag::True => Value::Bool(true),
                    Tag::False => Value::Bool(false),
                    _ => Value::None,
                });
                State::Scalar
            }
            Tag::Bytes => State::Bytes {
                len: VarintReader::new(self.limit),
                remaining: None,
                data: Vec::new(),
            },
            Tag::String => State::Str { named: false },
            Tag::StringEnc => State::Str { named: true },
            Tag::Tuple => State::Tuple { len: VarintReader::new(self.limit), count: None },
            Tag::Exception | Tag::Tagged => State::Wrap(tag),
            Tag::Float2 | Tag::Float10 | Tag::FloatN => State::Float(tag),
            Tag::RefLocal | Tag::RefRemote => State::Ref(tag),
        };
        Ok(state)
    }

    /// Embedded decoders to run next; call once the header is done.
    pub(crate) fn children(&self) -> Children {
        match &self.state {
            State::Tuple { count: Some(n), .. } => Children::new(Kind::Entity, *n),
            State::Str { named: true } => Children::new(Kind::Bytes, 2),
            State::Str { named: false } => Children::new(Kind::Bytes, 1),
            State::Wrap(_) => Children::new(Kind::Tuple, 1),
            State::Float(Tag::FloatN) => Children::new(Kind::Int, 3),
            State::Float(_) => Children::new(Kind::Int, 2),
            State::Ref(_) => Children::new(Kind::Int, 1),
            _ => Children::none(),
        }
    }

    /// Hands over the finished children, in the order they were requested.
    pub(crate) fn put_children(&mut self, items: Vec<Value>, context: &Context) -> Result<()> {
        let expected = self.children().len();
        if items.len() != expected {
            return Err(Error::InvalidValue(format!(
                "expected {} embedded values, got {}",
                expected,
                items.len()
            )));
        }
        let mut items = items.into_iter();
        let value = match &self.state {
            State::Tuple { .. } => Value::Tuple(items.collect()),
            State::Str { named } => {
                let codec = if *named {
                    StrCodec::from_name_bytes(&take_bytes(items.next())?)?
                } else {
                    context
                        .str_codec()
                        .ok_or_else(|| Error::UnknownCodec("<no context default>".into()))?
                };
                Value::Utf(codec.decode(&take_bytes(items.next())?)?)
            }
            State::Wrap(Tag::Exception) => Value::Exception(take_tuple(items.next())?),
            State::Wrap(_) => {
                let mut parts = take_tuple(items.next())?.into_iter();
                let inner = parts
                    .next()
                    .ok_or_else(|| Error::InvalidValue("tagged value without a value".into()))?;
                Value::Tagged(Box::new(inner), parts.collect())
            }
            State::Float(tag) => {
                let digits = take_int(items.next())?;
                let base = match tag {
                    Tag::Float2 => BigInt::from(2),
                    Tag::Float10 => BigInt::from(10),
                    _ => take_int(items.next())?,
                };
                let exp = take_int(items.next())?;
                Value::Float(Float::new(digits, base, exp)?)
            }
            State::Ref(tag) => {
                let id = take_int(items.next())?.to_u64().ok_or(Error::IdOutOfRange)?;
                if *tag == Tag::RefLocal {
                    // the sender's own object: a proxy on this side
                    Value::Object(ObjectRef::Remote(context.receive_remote(id)?))
                } else {
                    // one of ours, as it was registered
                    Value::Object(context.local_ref_for(id)?)
                }
            }
            _ => return Ok(()),
        };
        self.result = Some(value);
        Ok(())
    }

    /// Consumes raw payload bytes; true once the payload is complete.
    pub(crate) fn decode_payload(&mut self, cur: &mut Cursor<'_>) -> Result<bool> {
        let State::Bytes { remaining: Some(remaining), data, .. } = &mut self.state else {
            return Ok(true);
        };
        let chunk = cur.take_up_to(*remaining);
        data.extend_from_slice(chunk);
        *remaining -= chunk.len();
        if *remaining > 0 {
            return Ok(false);
        }
        self.result = Some(Value::Bytes(std::mem::take(data)));
        Ok(true)
    }

    pub(crate) fn into_result(self) -> Result<Value> {
        self.result.ok_or(Error::Incomplete)
    }
}

fn take_bytes(value: Option<Value>) -> Result<Vec<u8>> {
    match value {
        Some(Value::Bytes(data)) => Ok(data),
        _ => Err(Error::InvalidValue("expected embedded bytes".into())),
    }
}

fn take_tuple(value: Option<Value>) -> Result<Vec<Value>> {
    match value {
        Some(Value::Tuple(items)) => Ok(items),
        _ => Err(Error::InvalidValue("expected embedded tuple".into())),
    }
}

fn take_int(value: Option<Value>) -> Result<BigInt> {
    match value {
        Some(Value::Int(n)) => Ok(n),
        _ => Err(Error::InvalidValue("expected embedded integer".into())),
    }
}
