use std::sync::Arc;

use num_bigint::BigInt;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::CallContext;
use crate::CallFailure;
use crate::CallResult;
use crate::Context;
use crate::EmptyObject;
use crate::Error;
use crate::Float;
use crate::LocalObject;
use crate::ObjectRef;
use crate::Reader;
use crate::ReaderLimits;
use crate::Release;
use crate::RemoteCaller;
use crate::RemoteRef;
use crate::Result;
use crate::StrCodec;
use crate::Value;
use crate::Writer;
use crate::decode;
use crate::encode;

type R<T> = Result<T>;

fn roundtrip(value: &Value) -> R<Value> {
    let ctx = Context::new();
    let bytes = encode(value, &ctx)?;
    decode(&bytes, &ctx)
}

fn read_in_chunks(bytes: &[u8], cuts: &[usize], ctx: &Arc<Context>) -> R<Value> {
    let mut reader = Reader::new(ctx.clone());
    let mut start = 0;
    for &end in cuts.iter().chain(std::iter::once(&bytes.len())) {
        let consumed = reader.read(&bytes[start..end])?;
        assert_eq!(consumed, end - start);
        start = end;
    }
    assert!(reader.done());
    assert_eq!(reader.num_read(), bytes.len());
    reader.result()
}

fn sample() -> Value {
    tuple![
        0,
        237,
        238,
        -2,
        BigInt::from(1) << 100u32,
        -(BigInt::from(1) << 80u32),
        true,
        (),
        Value::Bytes(vec![0xAB; 300]),
        "naïve text",
        tuple![tuple![], Value::Exception(vec!["boom".into(), 3.into()])],
        Value::tagged(5, vec!["unit".into(), tuple![1, 2]]),
        Float::base10(-314, -2),
        Float::new(BigInt::from(7), BigInt::from(3), BigInt::from(-4)).unwrap(),
    ]
}

// ============================================================================
// Wire layout
// ============================================================================

#[test]
fn test_integer_boundary_bytes() -> R<()> {
    let ctx = Context::new();
    let cases: &[(i64, &[u8])] = &[
        (-3, &[0xF0, 0x01]),
        (-2, &[0xF0, 0x00]),
        (-1, &[0x00]),
        (0, &[0x01]),
        (236, &[0xED]),
        (237, &[0xEE]),
        (238, &[0xEF, 0x00]),
        (239, &[0xEF, 0x01]),
        (484, &[0xEF, 0xF6]),
        (485, &[0xEF, 0xF7, 0x00]),
    ];
    for (n, expected) in cases {
        let bytes = encode(&Value::from(*n), &ctx)?;
        assert_eq!(bytes.as_slice(), *expected, "encoding of {}", n);
        assert_eq!(decode(&bytes, &ctx)?, Value::from(*n));
    }
    Ok(())
}

#[test]
fn test_scalar_bytes() -> R<()> {
    let ctx = Context::new();
    assert_eq!(encode(&Value::Bool(false), &ctx)?, vec![0xF1]);
    assert_eq!(encode(&Value::Bool(true), &ctx)?, vec![0xF2]);
    assert_eq!(encode(&Value::None, &ctx)?, vec![0xF8]);
    assert_eq!(encode(&Value::from(&b"ab"[..]), &ctx)?, vec![0xF3, 0x02, b'a', b'b']);
    assert_eq!(encode(&Value::from("hi"), &ctx)?, vec![0xF4, 0x02, b'h', b'i']);
    Ok(())
}

#[test]
fn test_payloads_follow_headers_in_reverse() -> R<()> {
    let ctx = Context::new();
    let value = tuple![&b"a"[..], &b"bc"[..]];
    let bytes = encode(&value, &ctx)?;
    assert_eq!(bytes, vec![0xF6, 0x02, 0xF3, 0x01, 0xF3, 0x02, b'b', b'c', b'a']);
    assert_eq!(decode(&bytes, &ctx)?, value);
    Ok(())
}

#[test]
fn test_composite_bytes() -> R<()> {
    let ctx = Context::new();
    assert_eq!(encode(&tuple![], &ctx)?, vec![0xF6, 0x00]);
    assert_eq!(
        encode(&Value::Exception(vec!["boom".into()]), &ctx)?,
        vec![0xF7, 0x01, 0xF4, 0x04, b'b', b'o', b'o', b'm'],
    );
    assert_eq!(
        encode(&Value::tagged(5, vec!["t".into()]), &ctx)?,
        vec![0xFE, 0x02, 0x06, 0xF4, 0x01, b't'],
    );
    let half = Float::from_f64(0.5).unwrap();
    assert_eq!(encode(&Value::Float(half), &ctx)?, vec![0xFA, 0x02, 0x03]);
    Ok(())
}

#[test]
fn test_string_with_codec_name() -> R<()> {
    let ctx = Context::with_str_codec(None);
    let bytes = encode(&Value::from("hi"), &ctx)?;
    assert_eq!(bytes, vec![0xF5, 0x04, 0x02, b'h', b'i', b'u', b't', b'f', b'8']);
    assert_eq!(decode(&bytes, &ctx)?, Value::from("hi"));
    Ok(())
}

#[test]
fn test_string_without_any_codec_fails() {
    let ctx = Context::with_str_codec(None);
    let result = decode(&[0xF4, 0x01, b'x'], &ctx);
    assert!(matches!(result, Err(Error::UnknownCodec(_))));
}

#[test]
fn test_utf16_context() -> R<()> {
    let ctx = Context::with_str_codec(Some(StrCodec::Utf16));
    let value = Value::from("λx");
    let bytes = encode(&value, &ctx)?;
    assert_eq!(&bytes[..4], &[0xF4, 0x06, 0xFF, 0xFE]);
    assert_eq!(decode(&bytes, &ctx)?, value);
    Ok(())
}

// ============================================================================
// Round-trip and chunking
// ============================================================================

#[test]
fn test_roundtrip_composite() -> R<()> {
    let value = sample();
    assert_eq!(roundtrip(&value)?, value);
    Ok(())
}

#[test]
fn test_byte_at_a_time() -> R<()> {
    let ctx = Context::new();
    let value = sample();
    let bytes = encode(&value, &ctx)?;
    let cuts: Vec<usize> = (1..bytes.len()).collect();
    assert_eq!(read_in_chunks(&bytes, &cuts, &ctx)?, value);
    Ok(())
}

#[test]
fn test_random_chunking_is_invariant() -> R<()> {
    let ctx = Context::new();
    let value = sample();
    let bytes = encode(&value, &ctx)?;
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..50 {
        let num_cuts = rng.gen_range(0..12);
        let mut cuts: Vec<usize> = (0..num_cuts).map(|_| rng.gen_range(1..bytes.len())).collect();
        cuts.sort_unstable();
        cuts.dedup();
        assert_eq!(read_in_chunks(&bytes, &cuts, &ctx)?, value);
    }
    Ok(())
}

#[test]
fn test_reader_stops_at_value_end() -> R<()> {
    let ctx = Context::new();
    let mut stream = encode(&tuple![1, "two"], &ctx)?;
    stream.extend(encode(&Value::from(3), &ctx)?);

    let mut reader = Reader::new(ctx.clone());
    let consumed = reader.read(&stream)?;
    assert!(reader.done());
    assert_eq!(reader.result()?, tuple![1, "two"]);

    reader.reset();
    assert_eq!(reader.read(&stream[consumed..])?, 1);
    assert_eq!(reader.result()?, Value::from(3));
    Ok(())
}

#[test]
fn test_float_natives() {
    for x in [0.5, -3.25, 1e-310, f64::MAX, 0.1] {
        let float = Float::from_f64(x).unwrap();
        assert_eq!(float.to_f64(), Some(x));
    }
    assert!(Float::from_f64(f64::NAN).is_none());
    assert_eq!(Float::base10(-314, -2).to_f64(), Some(-3.14));
}

// ============================================================================
// Object references
// ============================================================================

#[test]
fn test_reference_crosses_contexts() -> R<()> {
    let ours = Context::new();
    let theirs = Context::new();
    let obj = LocalObject::new(EmptyObject);

    let bytes = encode(&Value::from(obj.clone()), &ours)?;
    assert_eq!(bytes, vec![0xFC, 0x02]);
    assert_eq!(ours.local_send_count(1), Some(1));

    let first = decode(&bytes, &theirs)?;
    let second = decode(&bytes, &theirs)?;
    assert_eq!(first, second);
    assert_eq!(theirs.remote_recv_count(1), Some(2));

    let back = encode(&first, &theirs)?;
    assert_eq!(back, vec![0xFD, 0x02]);
    assert_eq!(decode(&back, &ours)?, Value::from(obj));
    assert_eq!(ours.local_send_count(1), Some(1));
    Ok(())
}

/// Answers every call with the target's peer id and the arguments.
struct Echoing;

#[async_trait::async_trait]
impl RemoteCaller for Echoing {
    async fn call_remote(&self, target: &RemoteRef, args: Vec<Value>) -> CallResult {
        Ok(tuple![target.peer_id(), Value::Tuple(args)])
    }
}

#[tokio::test]
async fn test_proxy_of_another_context_is_forwarded() -> R<()> {
    let near = Context::new();
    let far = Context::new();
    far.set_remote_caller(Arc::new(Echoing));
    let proxy = far.remote_ref_for(7, true)?;
    let weak = proxy.downgrade();

    // goes out as one of ours, under a stable id
    let bytes = encode(&Value::from(proxy.clone()), &near)?;
    assert_eq!(bytes, vec![0xFC, 0x02]);
    assert_eq!(encode(&Value::from(proxy.clone()), &near)?, bytes);
    assert_eq!(near.local_send_count(1), Some(2));
    assert_eq!(far.num_local(), 0);

    // coming back, it is the same proxy again
    assert_eq!(decode(&[0xFD, 0x02], &near)?, Value::from(proxy.clone()));

    let target = ObjectRef::Remote(proxy);
    let forward = near.callable_for(&target)?;
    let ctx = CallContext::new(near.clone(), 1);
    let outcome = forward.object().execute(vec![Value::from("ping")], &ctx).await;
    assert_eq!(outcome, Ok(tuple![7, tuple!["ping"]]));

    // the registration keeps the proxy alive until the peer lets go
    drop(target);
    drop(forward);
    assert!(weak.upgrade().is_some());
    assert_eq!(near.release_local(1, 2), Release::Removed);
    assert!(weak.upgrade().is_none());
    Ok(())
}

#[tokio::test]
async fn test_forward_without_caller_is_invalid() -> R<()> {
    let near = Context::new();
    let far = Context::new();
    let target = ObjectRef::Remote(far.remote_ref_for(1, true)?);
    encode(&Value::from(target.clone()), &near)?;

    let forward = near.callable_for(&target)?;
    let ctx = CallContext::new(near.clone(), 1);
    let outcome = forward.object().execute(vec![], &ctx).await;
    assert!(matches!(outcome, Err(CallFailure::Invalid(_))));
    Ok(())
}

#[test]
fn test_unknown_local_id_fails() {
    let ctx = Context::new();
    assert_eq!(decode(&[0xFD, 0x0A], &ctx), Err(Error::UnknownObjectId(5)));
}

// ============================================================================
// Failure handling
// ============================================================================

#[test]
fn test_failed_reader_stays_failed_until_reset() -> R<()> {
    let ctx = Context::new();
    let mut reader = Reader::new(ctx.clone());
    assert_eq!(reader.read(&[0xF6, 0x01, 0xFF]), Err(Error::UnknownTag(0xFF)));
    assert!(reader.failed());
    assert_eq!(reader.read(&[0x01]), Err(Error::ReaderFailed));

    reader.reset();
    assert_eq!(reader.read(&[0x01])?, 1);
    assert_eq!(reader.result()?, Value::from(0));
    Ok(())
}

#[test]
fn test_incomplete_and_trailing() {
    let ctx = Context::new();
    assert_eq!(decode(&[0xF3, 0x03, 1], &ctx), Err(Error::Incomplete));
    assert_eq!(decode(&[0x01, 0x01], &ctx), Err(Error::TrailingData(1)));
}

#[test]
fn test_invalid_float_base() {
    let ctx = Context::new();
    // digits 1, base 1, exponent 0
    assert_eq!(decode(&[0xFB, 0x02, 0x02, 0x00], &ctx), Err(Error::InvalidFloatBase));
}

#[test]
fn test_tagged_needs_a_value() {
    let ctx = Context::new();
    assert!(matches!(decode(&[0xFE, 0x00], &ctx), Err(Error::InvalidValue(_))));
}

#[test]
fn test_limits_reject_hostile_headers() {
    let ctx = Context::new();

    let limits = ReaderLimits::default().with_max_payload(16);
    let mut reader = Reader::with_limits(ctx.clone(), limits);
    // declares a megabyte of payload, sends none of it
    let header = [0xF3, 0xF9, 0x0F, 0x41, 0x39];
    assert!(matches!(reader.read(&header), Err(Error::LimitExceeded(_))));

    let limits = ReaderLimits::default().with_max_objects(4);
    let mut reader = Reader::with_limits(ctx.clone(), limits);
    assert!(matches!(reader.read(&[0xF6, 0x10]), Err(Error::LimitExceeded(_))));

    let limits = ReaderLimits::default().with_max_int_bytes(3);
    let mut reader = Reader::with_limits(ctx, limits);
    assert!(matches!(reader.read(&[0xEF, 0xFE]), Err(Error::LimitExceeded(_))));
}

// ============================================================================
// Writer
// ============================================================================

#[test]
fn test_writer_chunks() -> R<()> {
    let ctx = Context::new();
    let value = sample();
    let expected = encode(&value, &ctx)?;

    let mut writer = Writer::new();
    writer.set_value(&value, &ctx)?;
    assert_eq!(writer.set_value(&value, &ctx), Err(Error::WriterBusy));

    let mut out = Vec::new();
    while !writer.done() {
        let chunk = writer.write(Some(7));
        assert!(chunk.len() <= 7);
        out.extend(chunk);
    }
    assert_eq!(out, expected);

    writer.reset();
    assert!(!writer.done());
    Ok(())
}
