//! # Message Envelope
//!
//! After the handshake every value on the stream is a tuple
//! `(msg_id, code, payload)`. Message ids are minted by the sender and only
//! need to be unique per direction; replies name the call they answer by
//! its message id.

use orbpack::ObjectRef;
use orbpack::Value;
use orbpack::tuple;

use crate::call::CallMode;
use crate::error::LinkError;
use crate::error::Result;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCode {
    MethodCall = 1,
    MethodCallVoidResult = 2,
    MethodCallNoReturn = 3,
    CallResult = 4,
    CallException = 5,
    CallError = 6,
    NotifyDeref = 7,
    ConfirmDeref = 8,
    KeepAlive = 9,
}

impl MessageCode {
    pub const fn from_u64(code: u64) -> Option<Self> {
        match code {
            1 => Some(Self::MethodCall),
            2 => Some(Self::MethodCallVoidResult),
            3 => Some(Self::MethodCallNoReturn),
            4 => Some(Self::CallResult),
            5 => Some(Self::CallException),
            6 => Some(Self::CallError),
            7 => Some(Self::NotifyDeref),
            8 => Some(Self::ConfirmDeref),
            9 => Some(Self::KeepAlive),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub(crate) enum Body {
    Call { mode: CallMode, target: ObjectRef, args: Vec<Value> },
    Result { call_id: u64, value: Value },
    Exception { call_id: u64, value: Value },
    Error { call_id: u64 },
    NotifyDeref { id: u64, recv_count: u64 },
    ConfirmDeref { id: u64 },
    KeepAlive,
}

#[derive(Debug)]
pub(crate) struct Message {
    pub id: u64,
    pub body: Body,
}

impl Message {
    pub(crate) fn envelope(id: u64, code: MessageCode, payload: Value) -> Value {
        tuple![id, code as u8, payload]
    }

    pub(crate) fn parse(value: Value) -> Result<Message> {
        let Some(items) = value.into_tuple() else {
            return Err(violation("message is not a tuple"));
        };
        let [id, code, payload]: [Value; 3] = items
            .try_into()
            .map_err(|_| violation("message needs three elements"))?;
        let id = id.as_u64().ok_or_else(|| violation("message id is not an unsigned integer"))?;
        let code = code
            .as_u64()
            .and_then(MessageCode::from_u64)
            .ok_or_else(|| violation("unknown message code"))?;

        let body = match code {
            MessageCode::MethodCall => call(CallMode::Normal, payload)?,
            MessageCode::MethodCallVoidResult => call(CallMode::VoidResult, payload)?,
            MessageCode::MethodCallNoReturn => call(CallMode::NoReturn, payload)?,
            MessageCode::CallResult => {
                let (call_id, value) = id_pair(payload)?;
                Body::Result { call_id, value }
            }
            MessageCode::CallException => {
                let (call_id, value) = id_pair(payload)?;
                Body::Exception { call_id, value }
            }
            MessageCode::CallError => Body::Error { call_id: id_of(&payload)? },
            MessageCode::NotifyDeref => {
                let (id, count) = id_pair(payload)?;
                let recv_count = count
                    .as_u64()
                    .ok_or_else(|| violation("receive count is not an unsigned integer"))?;
                Body::NotifyDeref { id, recv_count }
            }
            MessageCode::ConfirmDeref => Body::ConfirmDeref { id: id_of(&payload)? },
            MessageCode::KeepAlive => Body::KeepAlive,
        };
        Ok(Message { id, body })
    }
}

fn call(mode: CallMode, payload: Value) -> Result<Body> {
    let Some(items) = payload.into_tuple() else {
        return Err(violation("call payload is not a tuple"));
    };
    let [target, args]: [Value; 2] = items
        .try_into()
        .map_err(|_| violation("call payload needs target and arguments"))?;
    let Value::Object(target) = target else {
        return Err(violation("call target is not a reference"));
    };
    let Some(args) = args.into_tuple() else {
        return Err(violation("call arguments are not a tuple"));
    };
    Ok(Body::Call { mode, target, args })
}

fn id_pair(payload: Value) -> Result<(u64, Value)> {
    let Some(items) = payload.into_tuple() else {
        return Err(violation("payload is not a tuple"));
    };
    let [id, value]: [Value; 2] = items
        .try_into()
        .map_err(|_| violation("payload needs two elements"))?;
    Ok((id_of(&id)?, value))
}

fn id_of(value: &Value) -> Result<u64> {
    value.as_u64().ok_or_else(|| violation("id is not an unsigned integer"))
}

fn violation(msg: &str) -> LinkError {
    LinkError::ProtocolViolation(msg.into())
}

#[cfg(test)]
mod tests {
    use orbpack::EmptyObject;
    use orbpack::LocalObject;

    use super::*;

    #[test]
    fn test_parses_calls_with_mode() {
        let target = LocalObject::new(EmptyObject);
        for (code, mode) in [
            (MessageCode::MethodCall, CallMode::Normal),
            (MessageCode::MethodCallVoidResult, CallMode::VoidResult),
            (MessageCode::MethodCallNoReturn, CallMode::NoReturn),
        ] {
            let payload = tuple![target.clone(), tuple!["add", 7, 3]];
            let msg = Message::parse(Message::envelope(5, code, payload)).unwrap();
            assert_eq!(msg.id, 5);
            match msg.body {
                Body::Call { mode: got, args, .. } => {
                    assert_eq!(got, mode);
                    assert_eq!(args.len(), 3);
                }
                other => panic!("unexpected body {:?}", other),
            }
        }
    }

    #[test]
    fn test_parses_replies_and_gc() {
        let msg = Message::parse(Message::envelope(2, MessageCode::CallResult, tuple![1, 10])).unwrap();
        assert!(matches!(msg.body, Body::Result { call_id: 1, value: Value::Int(_) }));

        let msg = Message::parse(Message::envelope(3, MessageCode::CallError, Value::from(1))).unwrap();
        assert!(matches!(msg.body, Body::Error { call_id: 1 }));

        let msg = Message::parse(Message::envelope(4, MessageCode::NotifyDeref, tuple![7, 2])).unwrap();
        assert!(matches!(msg.body, Body::NotifyDeref { id: 7, recv_count: 2 }));

        let msg = Message::parse(Message::envelope(5, MessageCode::KeepAlive, Value::None)).unwrap();
        assert!(matches!(msg.body, Body::KeepAlive));
    }

    #[test]
    fn test_rejects_malformed() {
        let bad = [
            Value::None,
            tuple![1, 2],
            tuple![1, 42, Value::None],
            tuple![-1, 9, Value::None],
            tuple![1, 1, tuple!["not a ref", tuple![]]],
            tuple![1, 4, Value::from(1)],
            tuple![1, 6, "x"],
        ];
        for value in bad {
            assert!(
                matches!(Message::parse(value), Err(LinkError::ProtocolViolation(_))),
            );
        }
    }
}
