//! Envelope types and the JSON wire format.
//!
//! Every message on the channel is one JSON object:
//!
//! ```text
//! {"dir":"call","seq":7,"method":"add","data":"{\"a\":2,\"b\":3}"}
//! {"dir":"reply","seq":7,"data":"5"}
//! {"dir":"reply","seq":8,"err":"Unknown method"}
//! ```
//!
//! `data` is itself JSON text (the payload is encoded twice), which is what
//! script peers produce with `JSON.stringify` on both levels.

use crate::engine::Seq;
use crate::error::{Result, RpcError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope role discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Call,
    Reply,
}

/// Raw wire shape, before role-specific validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireEnvelope {
    dir: Direction,
    seq: Seq,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    err: Option<String>,
}

/// A call request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEnvelope {
    pub seq: Seq,
    pub method: String,
    /// Encoded argument payload; `None` decodes as `null`.
    pub data: Option<String>,
}

/// A reply to an earlier call.
///
/// At most one of `data` and `err` is set; constructors and
/// [`Envelope::decode`] both enforce it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyEnvelope {
    pub seq: Seq,
    pub data: Option<String>,
    pub err: Option<String>,
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Call(CallEnvelope),
    Reply(ReplyEnvelope),
}

impl CallEnvelope {
    /// Build a call, encoding `args` into the payload.
    pub fn new(seq: Seq, method: impl Into<String>, args: &Value) -> Result<Self> {
        Ok(Self {
            seq,
            method: method.into(),
            data: Some(encode_payload(args)?),
        })
    }

    /// Decode the argument payload.
    pub fn args(&self) -> Result<Value> {
        decode_payload(self.data.as_deref())
    }
}

impl ReplyEnvelope {
    /// Successful reply carrying an encoded result.
    pub fn success(seq: Seq, result: &Value) -> Result<Self> {
        Ok(Self {
            seq,
            data: Some(encode_payload(result)?),
            err: None,
        })
    }

    /// Error reply with no data.
    pub fn failure(seq: Seq, err: impl Into<String>) -> Self {
        Self {
            seq,
            data: None,
            err: Some(err.into()),
        }
    }

    /// Turn the reply into the caller-facing outcome.
    ///
    /// An `err` becomes [`RpcError::Remote`]; otherwise the payload is decoded.
    pub fn into_result(self) -> Result<Value> {
        match self.err {
            Some(err) => Err(RpcError::Remote(err)),
            None => decode_payload(self.data.as_deref()),
        }
    }
}

impl Envelope {
    pub fn seq(&self) -> Seq {
        match self {
            Envelope::Call(call) => call.seq,
            Envelope::Reply(reply) => reply.seq,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Envelope::Call(_) => Direction::Call,
            Envelope::Reply(_) => Direction::Reply,
        }
    }

    /// Serialize to the JSON text handed to the transport.
    pub fn encode(&self) -> Result<String> {
        let wire = match self {
            Envelope::Call(call) => WireEnvelope {
                dir: Direction::Call,
                seq: call.seq,
                method: Some(call.method.clone()),
                data: call.data.clone(),
                err: None,
            },
            Envelope::Reply(reply) => WireEnvelope {
                dir: Direction::Reply,
                seq: reply.seq,
                method: None,
                data: reply.data.clone(),
                err: reply.err.clone(),
            },
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Parse and validate one inbound message.
    ///
    /// Fails with [`RpcError::Decode`] on malformed JSON, a missing or unknown
    /// `dir`, a missing or non-integer `seq`, or a call without a method.
    pub fn decode(raw: &str) -> Result<Self> {
        let wire: WireEnvelope = serde_json::from_str(raw)
            .map_err(|e| RpcError::decode(format!("malformed envelope: {}", e)))?;

        match wire.dir {
            Direction::Call => {
                let method = match wire.method {
                    Some(m) if !m.is_empty() => m,
                    _ => {
                        return Err(RpcError::decode(format!(
                            "call {} has no method",
                            wire.seq
                        )))
                    }
                };
                Ok(Envelope::Call(CallEnvelope {
                    seq: wire.seq,
                    method,
                    data: wire.data,
                }))
            }
            Direction::Reply => {
                // err wins when a peer sets both
                let data = if wire.err.is_some() { None } else { wire.data };
                Ok(Envelope::Reply(ReplyEnvelope {
                    seq: wire.seq,
                    data,
                    err: wire.err,
                }))
            }
        }
    }
}

impl From<CallEnvelope> for Envelope {
    fn from(call: CallEnvelope) -> Self {
        Envelope::Call(call)
    }
}

impl From<ReplyEnvelope> for Envelope {
    fn from(reply: ReplyEnvelope) -> Self {
        Envelope::Reply(reply)
    }
}

/// Encode a payload value into the `data` field's JSON text.
pub fn encode_payload(value: &Value) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

/// Decode the `data` field. A missing field is `null`.
pub fn decode_payload(data: Option<&str>) -> Result<Value> {
    match data {
        None => Ok(Value::Null),
        Some(text) => serde_json::from_str(text)
            .map_err(|e| RpcError::decode(format!("malformed payload: {}", e))),
    }
}
