//! # Variable-Length Integers
//!
//! Unsigned integers ("posints") of any size, big-endian.
//!
//! ## Layout
//!
//! - `0..=246`: a single byte holding the value.
//! - `247..=254`: the value minus 247 in `first - 246` big-endian bytes.
//! - `255`: a nested posint `L` followed by `L + 9` big-endian bytes.
//!
//! Signed integers fold into posints: `n >= 0` maps to `2n`, `n < 0` maps
//! to `1 - 2n`.

use num_bigint::BigInt;
use num_bigint::BigUint;
use num_bigint::Sign;
use num_traits::ToPrimitive;

use crate::cursor::Cursor;
use crate::types::Error;
use crate::types::Result;

const ONE_BYTE_MAX: u8 = 246;
const OFFSET: u32 = 247;
const LONG_FORM: u8 = 0xFF;
const LONG_FORM_MIN_BYTES: usize = 9;

// Two levels of length prefix already cover more data than can be addressed.
const MAX_NESTING: usize = 4;

pub fn write_posint(n: &BigUint, out: &mut Vec<u8>) {
    if let Some(small) = n.to_u8() {
        if small <= ONE_BYTE_MAX {
            out.push(small);
            return;
        }
    }
    let data = (n - OFFSET).to_bytes_be();
    if data.len() < LONG_FORM_MIN_BYTES {
        out.push(ONE_BYTE_MAX + data.len() as u8);
    } else {
        out.push(LONG_FORM);
        write_posint(&BigUint::from(data.len() - LONG_FORM_MIN_BYTES), out);
    }
    out.extend_from_slice(&data);
}

pub fn write_len(len: usize, out: &mut Vec<u8>) {
    write_posint(&BigUint::from(len), out);
}

pub fn write_signed(n: &BigInt, out: &mut Vec<u8>) {
    write_posint(&signed_to_posint(n), out);
}

pub fn posint_bytes(n: &BigUint) -> Vec<u8> {
    let mut out = Vec::new();
    write_posint(n, &mut out);
    out
}

pub fn signed_to_posint(n: &BigInt) -> BigUint {
    match n.sign() {
        Sign::Minus => (n.magnitude() << 1u32) + 1u32,
        _ => n.magnitude() << 1u32,
    }
}

pub fn posint_to_signed(u: BigUint) -> BigInt {
    let odd = u.bit(0);
    let half = u >> 1u32;
    if odd {
        -BigInt::from(half)
    } else {
        BigInt::from(half)
    }
}

/// Outcome of inspecting a possibly incomplete posint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// The posint is complete and spans `len` bytes.
    Done { value: BigUint, len: usize },
    /// At least this many bytes in total are needed.
    Need(usize),
}

/// Inspects the front of `data` without consuming anything.
pub fn probe_posint(data: &[u8]) -> Result<Probe> {
    probe_nested(data, 0)
}

fn probe_nested(data: &[u8], depth: usize) -> Result<Probe> {
    if depth > MAX_NESTING {
        return Err(Error::MalformedVarint);
    }
    let Some(&first) = data.first() else {
        return Ok(Probe::Need(1));
    };
    if first <= ONE_BYTE_MAX {
        return Ok(Probe::Done { value: BigUint::from(first), len: 1 });
    }
    let (prefix, num_bytes) = if first == LONG_FORM {
        match probe_nested(&data[1..], depth + 1)? {
            Probe::Need(n) => return Ok(Probe::Need(1 + n + LONG_FORM_MIN_BYTES)),
            Probe::Done { value, len } => {
                let num_bytes = value
                    .to_usize()
                    .and_then(|v| v.checked_add(LONG_FORM_MIN_BYTES))
                    .ok_or(Error::MalformedVarint)?;
                (1 + len, num_bytes)
            }
        }
    } else {
        (1, (first - ONE_BYTE_MAX) as usize)
    };
    let total = prefix.checked_add(num_bytes).ok_or(Error::MalformedVarint)?;
    if data.len() < total {
        return Ok(Probe::Need(total));
    }
    let value = BigUint::from_bytes_be(&data[prefix..total]) + OFFSET;
    Ok(Probe::Done { value, len: total })
}

/// Decodes a complete posint from the front of `data`.
pub fn decode_posint(data: &[u8]) -> Result<Option<(BigUint, usize)>> {
    match probe_posint(data)? {
        Probe::Done { value, len } => Ok(Some((value, len))),
        Probe::Need(_) => Ok(None),
    }
}

/// Accumulates a posint across input chunks, consuming only its own bytes.
#[derive(Debug, Clone, Default)]
pub struct VarintReader {
    buf: Vec<u8>,
    limit: Option<usize>,
}

impl VarintReader {
    pub fn new(limit: Option<usize>) -> Self {
        Self { buf: Vec::new(), limit }
    }

    /// Feeds bytes from `cur`; returns the value once complete.
    pub fn feed(&mut self, cur: &mut Cursor<'_>) -> Result<Option<BigUint>> {
        loop {
            match probe_posint(&self.buf)? {
                Probe::Done { value, .. } => {
                    self.buf.clear();
                    return Ok(Some(value));
                }
                Probe::Need(total) => {
                    if self.limit.is_some_and(|limit| total > limit) {
                        return Err(Error::LimitExceeded(format!("integer of {} bytes", total)));
                    }
                    let chunk = cur.take_up_to(total - self.buf.len());
                    if chunk.is_empty() {
                        return Ok(None);
                    }
                    self.buf.extend_from_slice(chunk);
                }
            }
        }
    }

    /// Minimum bytes still required, as far as the buffered prefix tells.
    pub fn min_needed(&self) -> usize {
        match probe_posint(&self.buf) {
            Ok(Probe::Need(total)) => total - self.buf.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Converts a decoded length into `usize`.
pub fn to_len(n: &BigUint) -> Result<usize> {
    n.to_usize().ok_or(Error::LengthMismatch)
}
