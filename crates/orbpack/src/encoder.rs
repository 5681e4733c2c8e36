//! # Encoder
//!
//! Turns a `Value` into its self-delimiting byte form.
//!
//! ## Layout
//!
//! Every value splits into a header, zero or more embedded child values and
//! a raw payload. The output is all headers in depth-first order, followed
//! by all payloads in reverse depth-first order. A reader can then parse the
//! whole tree of headers before it needs a single payload byte, and resolve
//! payloads with a stack.
//!
//! Top-level values and tuple members are *explicit* (they start with a tag
//! byte). Fixed-schema parts such as a float's exponent are *implicit*.

use std::borrow::Cow;

use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::context::Context;
use crate::strcodec::StrCodec;
use crate::types::Error;
use crate::types::PACKED_MAX;
use crate::types::Result;
use crate::types::Tag;
use crate::value::ObjectRef;
use crate::value::Value;
use crate::varint;

/// A unit of work for the encoder: one header plus its embedded parts.
enum Part<'v> {
    Entity(&'v Value),
    Int(BigInt),
    Bytes(Cow<'v, [u8]>),
    Tuple(&'v [Value]),
    /// The implicit tuple `(value, tag1, tag2, ...)` of a tagged value.
    Tagged(&'v Value, &'v [Value]),
}

/// Encodes values against one context.
///
/// Encoding an object reference registers it with the context and counts the
/// send, so encoding is not a pure function of the value.
pub struct Encoder<'c> {
    context: &'c Context,
}

impl<'c> Encoder<'c> {
    pub fn new(context: &'c Context) -> Self {
        Self { context }
    }

    /// Explicit encoding of `value`.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut payloads: Vec<Cow<'_, [u8]>> = Vec::new();
        let mut work = vec![Part::Entity(value)];

        while let Some(part) = work.pop() {
            let first_child = work.len();
            if let Some(payload) = self.header(part, &mut out, &mut work)? {
                payloads.push(payload);
            }
            // children were pushed in order; the first must pop first
            work[first_child..].reverse();
        }

        for payload in payloads.iter().rev() {
            out.extend_from_slice(payload);
        }
        Ok(out)
    }

    fn header<'v>(
        &self,
        part: Part<'v>,
        out: &mut Vec<u8>,
        work: &mut Vec<Part<'v>>,
    ) -> Result<Option<Cow<'v, [u8]>>> {
        match part {
            Part::Entity(value) => self.entity(value, out, work),
            Part::Int(n) => {
                varint::write_signed(&n, out);
                Ok(None)
            }
            Part::Bytes(data) => {
                varint::write_len(data.len(), out);
                Ok(Some(data))
            }
            Part::Tuple(items) => {
                varint::write_len(items.len(), out);
                work.extend(items.iter().map(Part::Entity));
                Ok(None)
            }
            Part::Tagged(value, tags) => {
                varint::write_len(1 + tags.len(), out);
                work.push(Part::Entity(value));
                work.extend(tags.iter().map(Part::Entity));
                Ok(None)
            }
        }
    }

    fn entity<'v>(
        &self,
        value: &'v Value,
        out: &mut Vec<u8>,
        work: &mut Vec<Part<'v>>,
    ) -> Result<Option<Cow<'v, [u8]>>> {
        match value {
            Value::Int(n) => write_int(n, out),
            Value::Bool(true) => out.push(Tag::True as u8),
            Value::Bool(false) => out.push(Tag::False as u8),
            Value::None => out.push(Tag::None as u8),
            Value::Float(float) => {
                let base = float.base().to_u8();
                let tag = match base {
                    Some(2) => Tag::Float2,
                    Some(10) => Tag::Float10,
                    _ => Tag::FloatN,
                };
                out.push(tag as u8);
                work.push(Part::Int(float.digits().clone()));
                if tag == Tag::FloatN {
                    work.push(Part::Int(float.base().clone()));
                }
                work.push(Part::Int(float.exp().clone()));
            }
            Value::Bytes(data) => {
                out.push(Tag::Bytes as u8);
                varint::write_len(data.len(), out);
                return Ok(Some(Cow::Borrowed(data)));
            }
            Value::Utf(text) => match self.context.str_codec() {
                Some(codec) => {
                    out.push(Tag::String as u8);
                    work.push(Part::Bytes(Cow::Owned(codec.encode(text))));
                }
                None => {
                    let codec = StrCodec::Utf8;
                    out.push(Tag::StringEnc as u8);
                    work.push(Part::Bytes(Cow::Borrowed(codec.name().as_bytes())));
                    work.push(Part::Bytes(Cow::Borrowed(text.as_bytes())));
                }
            },
            Value::Tuple(items) => {
                out.push(Tag::Tuple as u8);
                varint::write_len(items.len(), out);
                work.extend(items.iter().map(Part::Entity));
            }
            Value::Exception(args) => {
                out.push(Tag::Exception as u8);
                work.push(Part::Tuple(args));
            }
            Value::Tagged(inner, tags) => {
                out.push(Tag::Tagged as u8);
                work.push(Part::Tagged(inner, tags));
            }
            Value::Object(ObjectRef::Remote(remote)) if remote.is_bound_to(self.context) => {
                out.push(Tag::RefRemote as u8);
                work.push(Part::Int(BigInt::from(remote.peer_id())));
            }
            // another context's proxy goes out as one of ours
            Value::Object(obj) => {
                out.push(Tag::RefLocal as u8);
                let id = self.context.send_local(obj)?;
                work.push(Part::Int(BigInt::from(id)));
            }
        }
        Ok(None)
    }
}

/// Explicit integer: packed into the tag byte near zero, otherwise a sign tag
/// and the distance from the packed range.
pub fn write_int(n: &BigInt, out: &mut Vec<u8>) {
    if let Some(small) = n.to_i64() {
        if (-1..=PACKED_MAX).contains(&small) {
            out.push((small + 1) as u8);
            return;
        }
    }
    if n.sign() == num_bigint::Sign::Minus {
        out.push(Tag::IntNeg as u8);
        varint::write_posint(&(n.magnitude() - 2u32), out);
    } else {
        out.push(Tag::IntPos as u8);
        varint::write_posint(&(n.magnitude() - (PACKED_MAX as u32 + 1)), out);
    }
}

/// Encodes `value` in one step.
pub fn encode(value: &Value, context: &Context) -> Result<Vec<u8>> {
    Encoder::new(context).encode(value)
}

/// Holds one encoded value and hands it out in bounded chunks.
#[derive(Debug, Default)]
pub struct Writer {
    data: Vec<u8>,
    pos: usize,
    active: bool,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes `value`; fails while a previous value is still being written.
    pub fn set_value(&mut self, value: &Value, context: &Context) -> Result<()> {
        if self.active && !self.done() {
            return Err(Error::WriterBusy);
        }
        self.data = encode(value, context)?;
        self.pos = 0;
        self.active = true;
        Ok(())
    }

    /// Next chunk of at most `max` bytes, or everything left for `None`.
    pub fn write(&mut self, max: Option<usize>) -> Vec<u8> {
        let left = self.data.len() - self.pos;
        let len = max.map_or(left, |max| max.min(left));
        let chunk = self.data[self.pos..self.pos + len].to_vec();
        self.pos += len;
        chunk
    }

    pub fn done(&self) -> bool {
        self.active && self.pos == self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.pos = 0;
        self.active = false;
    }
}
