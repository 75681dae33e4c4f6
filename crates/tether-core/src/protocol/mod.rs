//! Wire protocol shared by both sides of the channel.
//!
//! One JSON envelope per message, either a call (`dir: "call"`) or a reply
//! (`dir: "reply"`), correlated by `seq`.

pub mod envelope;

pub use envelope::{
    decode_payload, encode_payload, CallEnvelope, Direction, Envelope, ReplyEnvelope,
};
