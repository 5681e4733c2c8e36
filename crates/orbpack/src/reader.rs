//! # Incremental Reader
//!
//! Rebuilds one top-level value from chunks of any size.
//!
//! ## Driving algorithm
//!
//! The reader keeps three stacks and never recurses:
//!
//! - `iters`: one child iterator per open nesting level. The next header
//!   decoder is pulled from the innermost one.
//! - `payloads`: decoders whose header is complete, each with the number of
//!   embedded results it is owed.
//! - `results`: finished values.
//!
//! Headers are parsed depth-first until no iterator is left. Then payload
//! decoders are popped, handed their children off the result stack, run to
//! completion and pushed as results. The value is done when one result remains.

use std::sync::Arc;

use tracing::trace;

use crate::context::Context;
use crate::cursor::Cursor;
use crate::decoder::Children;
use crate::decoder::Decoder;
use crate::decoder::Header;
use crate::decoder::Kind;
use crate::types::Error;
use crate::types::Result;
use crate::value::Value;

/// Bounds on what a single value may demand from the reader.
///
/// Checked against the decoders' lower estimates, so a hostile header is
/// rejected before its declared contents arrive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderLimits {
    /// Total values, counting every nested and implicit part.
    pub max_objects: Option<usize>,
    /// Total raw payload bytes.
    pub max_payload: Option<usize>,
    /// Encoded size of any single integer or length.
    pub max_int_bytes: Option<usize>,
}

impl ReaderLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_max_objects(mut self, max: usize) -> Self {
        self.max_objects = Some(max);
        self
    }

    pub fn with_max_payload(mut self, max: usize) -> Self {
        self.max_payload = Some(max);
        self
    }

    pub fn with_max_int_bytes(mut self, max: usize) -> Self {
        self.max_int_bytes = Some(max);
        self
    }
}

struct Pending {
    decoder: Decoder,
    children: usize,
    fed: bool,
}

enum Phase {
    Reading,
    Done(Option<Value>),
    Failed,
}

pub struct Reader {
    context: Arc<Context>,
    limits: ReaderLimits,
    header: Option<Decoder>,
    iters: Vec<Children>,
    payloads: Vec<Pending>,
    results: Vec<Value>,
    num_read: usize,
    num_objects: usize,
    num_payload: usize,
    phase: Phase,
}

impl Reader {
    pub fn new(context: Arc<Context>) -> Self {
        Self::with_limits(context, ReaderLimits::default())
    }

    pub fn with_limits(context: Arc<Context>, limits: ReaderLimits) -> Self {
        let mut reader = Self {
            context,
            limits,
            header: None,
            iters: Vec::new(),
            payloads: Vec::new(),
            results: Vec::new(),
            num_read: 0,
            num_objects: 0,
            num_payload: 0,
            phase: Phase::Reading,
        };
        reader.reset();
        reader
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Feeds one chunk and returns how many bytes of it were consumed.
    ///
    /// Never reads past the end of the value, so the unconsumed tail belongs
    /// to whatever follows on the stream.
    pub fn read(&mut self, data: &[u8]) -> Result<usize> {
        match self.phase {
            Phase::Failed => return Err(Error::ReaderFailed),
            Phase::Done(_) => return Ok(0),
            Phase::Reading => {}
        }
        let mut cur = Cursor::new(data);
        let outcome = self.advance(&mut cur);
        self.num_read += cur.pos();
        if let Err(e) = outcome {
            trace!(error = %e, num_read = self.num_read, "reader failed");
            self.fail();
            return Err(e);
        }
        Ok(cur.pos())
    }

    pub fn done(&self) -> bool {
        matches!(self.phase, Phase::Done(Some(_)))
    }

    pub fn failed(&self) -> bool {
        matches!(self.phase, Phase::Failed)
    }

    /// Takes the decoded value; the reader must be reset before reuse.
    pub fn result(&mut self) -> Result<Value> {
        match &mut self.phase {
            Phase::Done(value) => value.take().ok_or(Error::Incomplete),
            Phase::Failed => Err(Error::ReaderFailed),
            Phase::Reading => Err(Error::Incomplete),
        }
    }

    /// Bytes consumed since the last reset.
    pub fn num_read(&self) -> usize {
        self.num_read
    }

    pub fn reset(&mut self) {
        self.header = None;
        self.iters.clear();
        self.iters.push(Children::top());
        self.payloads.clear();
        self.results.clear();
        self.num_read = 0;
        self.num_objects = 0;
        self.num_payload = 0;
        self.phase = Phase::Reading;
    }

    /// Decodes exactly one value spanning all of `data`.
    pub fn decode(data: &[u8], context: Arc<Context>) -> Result<Value> {
        let mut reader = Reader::new(context);
        let consumed = reader.read(data)?;
        if !reader.done() {
            return Err(Error::Incomplete);
        }
        if consumed < data.len() {
            return Err(Error::TrailingData(data.len() - consumed));
        }
        reader.result()
    }

    fn fail(&mut self) {
        self.header = None;
        self.iters.clear();
        self.payloads.clear();
        self.results.clear();
        self.phase = Phase::Failed;
    }

    fn advance(&mut self, cur: &mut Cursor<'_>) -> Result<()> {
        // headers, depth-first
        loop {
            if self.header.is_none() {
                let Some(kind) = self.next_kind() else { break };
                self.num_objects += 1;
                self.header = Some(Decoder::new(kind, self.limits.max_int_bytes));
            }
            let Some(decoder) = self.header.as_mut() else { break };
            let header = decoder.decode_header(cur)?;
            self.check_limits(&header)?;
            if !header.done {
                return Ok(());
            }
            let Some(decoder) = self.header.take() else { break };
            self.num_payload += header.min_payload;
            let children = decoder.children();
            let count = children.len();
            if count > 0 {
                self.iters.push(children);
            }
            self.payloads.push(Pending { decoder, children: count, fed: false });
        }

        // payloads, last header first
        while let Some(top) = self.payloads.last_mut() {
            if !top.fed {
                let start = self
                    .results
                    .len()
                    .checked_sub(top.children)
                    .ok_or(Error::Incomplete)?;
                let mut items = self.results.split_off(start);
                // the last child finished first
                items.reverse();
                top.decoder.put_children(items, &self.context)?;
                top.fed = true;
            }
            if !top.decoder.decode_payload(cur)? {
                return Ok(());
            }
            if let Some(pending) = self.payloads.pop() {
                self.results.push(pending.decoder.into_result()?);
            }
        }

        if self.results.len() != 1 {
            return Err(Error::InvalidValue(format!("{} top-level results", self.results.len())));
        }
        self.phase = Phase::Done(self.results.pop());
        Ok(())
    }

    fn next_kind(&mut self) -> Option<Kind> {
        while let Some(iter) = self.iters.last_mut() {
            if let Some(kind) = iter.next() {
                return Some(kind);
            }
            self.iters.pop();
        }
        None
    }

    fn check_limits(&self, header: &Header) -> Result<()> {
        if let Some(max) = self.limits.max_objects {
            if self.num_objects + header.min_objects > max {
                return Err(Error::LimitExceeded(format!("more than {} values", max)));
            }
        }
        if let Some(max) = self.limits.max_payload {
            if self.num_payload + header.min_payload > max {
                return Err(Error::LimitExceeded(format!("more than {} payload bytes", max)));
            }
        }
        Ok(())
    }
}

/// Decodes one value spanning all of `data`.
pub fn decode(data: &[u8], context: &Arc<Context>) -> Result<Value> {
    Reader::decode(data, context.clone())
}
