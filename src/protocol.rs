//! Echo message schema, validation, and reply construction.
//!
//! Inbound messages are JSON objects with four required fields. The three
//! identity/payload fields are opaque to the server and copied verbatim
//! into every reply; only `created_at` has a required shape (an integer,
//! epoch milliseconds). Parsing is a two-step affair: JSON syntax first,
//! then per-field schema checks, so a bad message is reported against the
//! field it failed on rather than as a raw serde error.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientMessage {
    /// Opaque client identifier, copied verbatim into replies.
    pub client_id: Value,
    /// Opaque message identifier, copied verbatim into replies.
    pub msg_id: Value,
    /// Payload; type and shape are not validated.
    pub msg: Value,
    /// Client clock at send time, epoch milliseconds.
    pub created_at: i64,
}

/// The reply sent `write_factor` times per inbound message.
///
/// Field order matters: it is the wire order clients see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoReply {
    pub client_id: Value,
    pub msg_id: Value,
    pub msg: Value,
    /// Server clock at receipt, epoch milliseconds. Captured once per
    /// inbound message; every duplicate in the batch shares it.
    pub created_at: i64,
    /// The inbound `created_at`, renamed on the way out.
    pub client_ts: i64,
    /// Server receipt time minus client send time. Signed: clock skew
    /// between client and server can make this negative.
    pub server_latency: i64,
}

/// Message validation errors
#[derive(Debug, Error)]
pub enum ParseError {
    /// Body is not syntactically valid JSON.
    #[error("invalid JSON: {0}")]
    Syntax(#[from] serde_json::Error),

    /// Body is valid JSON but not an object.
    #[error("message is not a JSON object")]
    NotAnObject,

    /// A required field is absent.
    #[error("missing field `{0}`")]
    MissingField(&'static str),

    /// A required field is present but has the wrong type.
    #[error("field `{0}` has the wrong type")]
    InvalidField(&'static str),
}

/// Parse and validate an inbound message body.
pub fn parse(body: &[u8]) -> Result<ClientMessage, ParseError> {
    let value: Value = serde_json::from_slice(body)?;

    let mut object = match value {
        Value::Object(map) => map,
        _ => return Err(ParseError::NotAnObject),
    };

    let mut take = |field: &'static str| {
        object.remove(field).ok_or(ParseError::MissingField(field))
    };

    let client_id = take("client_id")?;
    let msg_id = take("msg_id")?;
    let msg = take("msg")?;
    let created_at = take("created_at")?
        .as_i64()
        .ok_or(ParseError::InvalidField("created_at"))?;

    Ok(ClientMessage {
        client_id,
        msg_id,
        msg,
        created_at,
    })
}

impl EchoReply {
    /// Build the reply for one inbound message. The caller captures
    /// `server_now_ms` once per inbound message, not per duplicate.
    pub fn build(inbound: ClientMessage, server_now_ms: i64) -> Self {
        EchoReply {
            server_latency: server_now_ms - inbound.created_at,
            client_ts: inbound.created_at,
            client_id: inbound.client_id,
            msg_id: inbound.msg_id,
            msg: inbound.msg,
            created_at: server_now_ms,
        }
    }

    /// Serialize to the wire form. Called once per batch; all duplicates
    /// share the resulting text.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Current time as epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
