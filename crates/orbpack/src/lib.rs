//! # orbpack
//!
//! A self-delimiting binary codec for a closed set of value types plus
//! object references, with a reader that resumes across arbitrary chunk
//! boundaries.
//!
//! ## Philosophy
//!
//! - **Self-delimiting**: a stream of values needs no outer framing; the
//!   reader stops exactly at the end of each value.
//! - **Bounded lookahead**: headers come first, payloads last, so nested
//!   values decode without recursion or buffering whole messages.
//! - **Session-bound references**: object references only mean something
//!   inside the `Context` that encoded or decoded them.

#[macro_use]
mod macros;

pub mod types;
pub mod cursor;
pub mod varint;
pub mod strcodec;
pub mod value;
pub mod object;
pub mod context;
pub mod encoder;
mod decoder;
pub mod reader;

pub use types::Error;
pub use types::Result;
pub use types::Tag;

pub use value::Float;
pub use value::LocalObject;
pub use value::ObjectRef;
pub use value::RemoteRef;
pub use value::Value;
pub use value::WeakRemoteRef;

pub use object::CallContext;
pub use object::CallFailure;
pub use object::CallResult;
pub use object::EmptyObject;
pub use object::Object;
pub use object::RemoteCaller;

pub use context::Context;
pub use context::DerefHook;
pub use context::Release;

pub use strcodec::StrCodec;

pub use encoder::Encoder;
pub use encoder::Writer;
pub use encoder::encode;

pub use reader::Reader;
pub use reader::ReaderLimits;
pub use reader::decode;

#[cfg(test)]
mod tests;
