//! Replication protocol message schemas and CBOR encoding.
//!
//! Every frame body is a three-entry map `{"v", "type", "body"}`. Decoding
//! is defensive: definite lengths only, explicit caps from [`Limits`], and
//! unknown map keys skipped so older peers tolerate newer senders.

use std::fmt;

use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;
use uuid::Uuid;

use crate::core::Limits;

pub const PROTOCOL_VERSION: u32 = 1;

/// Identity of one published computed value, stable across reconnects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicationId(Uuid);

impl PublicationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for PublicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReplEnvelope {
    pub version: u32,
    pub message: ReplMessage,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ReplMessage {
    Hello(Hello),
    Welcome(Welcome),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    Request(Request),
    State(State),
    Invalidate(Invalidate),
    Update(Update),
    Refused(Refused),
    Ping(Ping),
    Pong(Pong),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u32,
    pub client_id: Uuid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Welcome {
    pub protocol_version: u32,
    pub publisher_id: Uuid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subscribe {
    pub publication_id: PublicationId,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Unsubscribe {
    pub publication_id: PublicationId,
}

/// Replica-initiated pull, used when a stale replica cannot wait for the
/// next push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Request {
    pub publication_id: PublicationId,
}

/// Full current value, sent on subscribe and in answer to [`Request`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct State {
    pub publication_id: PublicationId,
    pub version: u64,
    pub payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Invalidate {
    pub publication_id: PublicationId,
    pub version: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub publication_id: PublicationId,
    pub version: u64,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Refused {
    pub publication_id: PublicationId,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ping {
    pub nonce: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pong {
    pub nonce: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MessageType {
    Hello,
    Welcome,
    Subscribe,
    Unsubscribe,
    Request,
    State,
    Invalidate,
    Update,
    Refused,
    Ping,
    Pong,
}

impl MessageType {
    fn as_str(self) -> &'static str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::Welcome => "WELCOME",
            MessageType::Subscribe => "SUBSCRIBE",
            MessageType::Unsubscribe => "UNSUBSCRIBE",
            MessageType::Request => "REQUEST",
            MessageType::State => "STATE",
            MessageType::Invalidate => "INVALIDATE",
            MessageType::Update => "UPDATE",
            MessageType::Refused => "REFUSED",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "HELLO" => Some(MessageType::Hello),
            "WELCOME" => Some(MessageType::Welcome),
            "SUBSCRIBE" => Some(MessageType::Subscribe),
            "UNSUBSCRIBE" => Some(MessageType::Unsubscribe),
            "REQUEST" => Some(MessageType::Request),
            "STATE" => Some(MessageType::State),
            "INVALIDATE" => Some(MessageType::Invalidate),
            "UPDATE" => Some(MessageType::Update),
            "REFUSED" => Some(MessageType::Refused),
            "PING" => Some(MessageType::Ping),
            "PONG" => Some(MessageType::Pong),
            _ => None,
        }
    }
}

impl ReplMessage {
    fn message_type(&self) -> MessageType {
        match self {
            ReplMessage::Hello(_) => MessageType::Hello,
            ReplMessage::Welcome(_) => MessageType::Welcome,
            ReplMessage::Subscribe(_) => MessageType::Subscribe,
            ReplMessage::Unsubscribe(_) => MessageType::Unsubscribe,
            ReplMessage::Request(_) => MessageType::Request,
            ReplMessage::State(_) => MessageType::State,
            ReplMessage::Invalidate(_) => MessageType::Invalidate,
            ReplMessage::Update(_) => MessageType::Update,
            ReplMessage::Refused(_) => MessageType::Refused,
            ReplMessage::Ping(_) => MessageType::Ping,
            ReplMessage::Pong(_) => MessageType::Pong,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoEncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<std::convert::Infallible>),
    #[error("envelope version {envelope} does not match body version {body}")]
    VersionMismatch { envelope: u32, body: u32 },
}

#[derive(Debug, Error)]
pub enum ProtoDecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
    #[error("trailing bytes after message body")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

pub fn encode_envelope(envelope: &ReplEnvelope) -> Result<Vec<u8>, ProtoEncodeError> {
    let mut buf = Vec::new();
    let mut enc = Encoder::new(&mut buf);
    enc.map(3)?;
    enc.str("v")?;
    enc.u32(envelope.version)?;
    enc.str("type")?;
    enc.str(envelope.message.message_type().as_str())?;
    enc.str("body")?;
    encode_message_body(&mut enc, envelope)?;
    Ok(buf)
}

pub fn decode_envelope(bytes: &[u8], limits: &Limits) -> Result<ReplEnvelope, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let map_len = decode_map_len(&mut dec, limits, 0)?;

    let mut version = None;
    let mut message_type = None;
    let mut body_span = None;

    for _ in 0..map_len {
        let key = decode_text(&mut dec, limits)?;
        match key {
            "v" => version = Some(decode_u32(&mut dec, "v")?),
            "type" => {
                let raw = decode_text(&mut dec, limits)?;
                message_type = Some(
                    MessageType::parse(raw)
                        .ok_or_else(|| ProtoDecodeError::UnknownMessageType(raw.to_string()))?,
                );
            }
            "body" => {
                let start = dec.position();
                dec.skip()?;
                let end = dec.position();
                body_span = Some((start, end));
            }
            _ => {
                if is_indefinite(&dec)? {
                    return Err(ProtoDecodeError::IndefiniteLength);
                }
                dec.skip()?;
            }
        }
    }

    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }

    let version = version.ok_or(ProtoDecodeError::MissingField("v"))?;
    let message_type = message_type.ok_or(ProtoDecodeError::MissingField("type"))?;
    let (start, end) = body_span.ok_or(ProtoDecodeError::MissingField("body"))?;
    let body_bytes = &bytes[start..end];

    let message = decode_message_body(version, message_type, body_bytes, limits)?;
    Ok(ReplEnvelope { version, message })
}

fn encode_message_body(
    enc: &mut Encoder<&mut Vec<u8>>,
    envelope: &ReplEnvelope,
) -> Result<(), ProtoEncodeError> {
    match &envelope.message {
        ReplMessage::Hello(msg) => {
            if envelope.version != msg.protocol_version {
                return Err(ProtoEncodeError::VersionMismatch {
                    envelope: envelope.version,
                    body: msg.protocol_version,
                });
            }
            enc.map(2)?;
            enc.str("protocol_version")?;
            enc.u32(msg.protocol_version)?;
            enc.str("client_id")?;
            encode_uuid(enc, &msg.client_id)?;
        }
        ReplMessage::Welcome(msg) => {
            if envelope.version != msg.protocol_version {
                return Err(ProtoEncodeError::VersionMismatch {
                    envelope: envelope.version,
                    body: msg.protocol_version,
                });
            }
            enc.map(2)?;
            enc.str("protocol_version")?;
            enc.u32(msg.protocol_version)?;
            enc.str("publisher_id")?;
            encode_uuid(enc, &msg.publisher_id)?;
        }
        ReplMessage::Subscribe(msg) => encode_publication_only(enc, &msg.publication_id)?,
        ReplMessage::Unsubscribe(msg) => encode_publication_only(enc, &msg.publication_id)?,
        ReplMessage::Request(msg) => encode_publication_only(enc, &msg.publication_id)?,
        ReplMessage::State(msg) => {
            encode_versioned_payload(enc, &msg.publication_id, msg.version, Some(&msg.payload))?
        }
        ReplMessage::Invalidate(msg) => {
            encode_versioned_payload(enc, &msg.publication_id, msg.version, None)?
        }
        ReplMessage::Update(msg) => {
            encode_versioned_payload(enc, &msg.publication_id, msg.version, Some(&msg.payload))?
        }
        ReplMessage::Refused(msg) => {
            enc.map(2)?;
            enc.str("publication_id")?;
            encode_uuid(enc, msg.publication_id.as_uuid())?;
            enc.str("reason")?;
            enc.str(&msg.reason)?;
        }
        ReplMessage::Ping(msg) => {
            enc.map(1)?;
            enc.str("nonce")?;
            enc.u64(msg.nonce)?;
        }
        ReplMessage::Pong(msg) => {
            enc.map(1)?;
            enc.str("nonce")?;
            enc.u64(msg.nonce)?;
        }
    }
    Ok(())
}

fn encode_publication_only(
    enc: &mut Encoder<&mut Vec<u8>>,
    publication_id: &PublicationId,
) -> Result<(), ProtoEncodeError> {
    enc.map(1)?;
    enc.str("publication_id")?;
    encode_uuid(enc, publication_id.as_uuid())?;
    Ok(())
}

fn encode_versioned_payload(
    enc: &mut Encoder<&mut Vec<u8>>,
    publication_id: &PublicationId,
    version: u64,
    payload: Option<&[u8]>,
) -> Result<(), ProtoEncodeError> {
    let len = if payload.is_some() { 3 } else { 2 };
    enc.map(len)?;
    enc.str("publication_id")?;
    encode_uuid(enc, publication_id.as_uuid())?;
    enc.str("version")?;
    enc.u64(version)?;
    if let Some(payload) = payload {
        enc.str("payload")?;
        enc.bytes(payload)?;
    }
    Ok(())
}

fn decode_message_body(
    version: u32,
    message_type: MessageType,
    bytes: &[u8],
    limits: &Limits,
) -> Result<ReplMessage, ProtoDecodeError> {
    let mut dec = Decoder::new(bytes);
    let message = match message_type {
        MessageType::Hello => {
            let (protocol_version, id) = decode_versioned_peer(&mut dec, limits, "client_id")?;
            ReplMessage::Hello(Hello {
                protocol_version,
                client_id: id,
            })
        }
        MessageType::Welcome => {
            let (protocol_version, id) = decode_versioned_peer(&mut dec, limits, "publisher_id")?;
            ReplMessage::Welcome(Welcome {
                protocol_version,
                publisher_id: id,
            })
        }
        MessageType::Subscribe => ReplMessage::Subscribe(Subscribe {
            publication_id: decode_publication_only(&mut dec, limits)?,
        }),
        MessageType::Unsubscribe => ReplMessage::Unsubscribe(Unsubscribe {
            publication_id: decode_publication_only(&mut dec, limits)?,
        }),
        MessageType::Request => ReplMessage::Request(Request {
            publication_id: decode_publication_only(&mut dec, limits)?,
        }),
        MessageType::State => {
            let (publication_id, version, payload) =
                decode_versioned_payload(&mut dec, limits, true)?;
            ReplMessage::State(State {
                publication_id,
                version,
                payload: payload.unwrap_or_default(),
            })
        }
        MessageType::Invalidate => {
            let (publication_id, version, _) = decode_versioned_payload(&mut dec, limits, false)?;
            ReplMessage::Invalidate(Invalidate {
                publication_id,
                version,
            })
        }
        MessageType::Update => {
            let (publication_id, version, payload) =
                decode_versioned_payload(&mut dec, limits, true)?;
            ReplMessage::Update(Update {
                publication_id,
                version,
                payload: payload.unwrap_or_default(),
            })
        }
        MessageType::Refused => ReplMessage::Refused(decode_refused(&mut dec, limits)?),
        MessageType::Ping => ReplMessage::Ping(Ping {
            nonce: decode_nonce(&mut dec, limits)?,
        }),
        MessageType::Pong => ReplMessage::Pong(Pong {
            nonce: decode_nonce(&mut dec, limits)?,
        }),
    };

    if dec.datatype().is_ok() {
        return Err(ProtoDecodeError::TrailingBytes);
    }

    match &message {
        ReplMessage::Hello(msg) if msg.protocol_version != version => {
            Err(ProtoDecodeError::InvalidField {
                field: "protocol_version",
                reason: format!(
                    "body {body} does not match envelope v {version}",
                    body = msg.protocol_version
                ),
            })
        }
        ReplMessage::Welcome(msg) if msg.protocol_version != version => {
            Err(ProtoDecodeError::InvalidField {
                field: "protocol_version",
                reason: format!(
                    "body {body} does not match envelope v {version}",
                    body = msg.protocol_version
                ),
            })
        }
        _ => Ok(message),
    }
}

fn decode_versioned_peer(
    dec: &mut Decoder,
    limits: &Limits,
    id_field: &'static str,
) -> Result<(u32, Uuid), ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut protocol_version = None;
    let mut id = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        if key == "protocol_version" {
            protocol_version = Some(decode_u32(dec, "protocol_version")?);
        } else if key == id_field {
            id = Some(decode_uuid(dec, limits, id_field)?);
        } else {
            if is_indefinite(dec)? {
                return Err(ProtoDecodeError::IndefiniteLength);
            }
            dec.skip()?;
        }
    }

    Ok((
        protocol_version.ok_or(ProtoDecodeError::MissingField("protocol_version"))?,
        id.ok_or(ProtoDecodeError::MissingField(id_field))?,
    ))
}

fn decode_publication_only(
    dec: &mut Decoder,
    limits: &Limits,
) -> Result<PublicationId, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut publication_id = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "publication_id" => {
                publication_id = Some(decode_publication_id(dec, limits)?);
            }
            _ => {
                if is_indefinite(dec)? {
                    return Err(ProtoDecodeError::IndefiniteLength);
                }
                dec.skip()?;
            }
        }
    }

    publication_id.ok_or(ProtoDecodeError::MissingField("publication_id"))
}

fn decode_versioned_payload(
    dec: &mut Decoder,
    limits: &Limits,
    payload_expected: bool,
) -> Result<(PublicationId, u64, Option<Vec<u8>>), ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut publication_id = None;
    let mut version = None;
    let mut payload = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "publication_id" => publication_id = Some(decode_publication_id(dec, limits)?),
            "version" => version = Some(dec.u64()?),
            "payload" => {
                let raw = decode_bytes(dec, limits, "payload")?;
                payload = Some(raw.to_vec());
            }
            _ => {
                if is_indefinite(dec)? {
                    return Err(ProtoDecodeError::IndefiniteLength);
                }
                dec.skip()?;
            }
        }
    }

    if payload_expected && payload.is_none() {
        return Err(ProtoDecodeError::MissingField("payload"));
    }

    Ok((
        publication_id.ok_or(ProtoDecodeError::MissingField("publication_id"))?,
        version.ok_or(ProtoDecodeError::MissingField("version"))?,
        payload,
    ))
}

fn decode_refused(dec: &mut Decoder, limits: &Limits) -> Result<Refused, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut publication_id = None;
    let mut reason = None;

    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "publication_id" => publication_id = Some(decode_publication_id(dec, limits)?),
            "reason" => reason = Some(decode_text(dec, limits)?.to_string()),
            _ => {
                if is_indefinite(dec)? {
                    return Err(ProtoDecodeError::IndefiniteLength);
                }
                dec.skip()?;
            }
        }
    }

    Ok(Refused {
        publication_id: publication_id.ok_or(ProtoDecodeError::MissingField("publication_id"))?,
        reason: reason.ok_or(ProtoDecodeError::MissingField("reason"))?,
    })
}

fn decode_nonce(dec: &mut Decoder, limits: &Limits) -> Result<u64, ProtoDecodeError> {
    let map_len = decode_map_len(dec, limits, 1)?;
    let mut nonce = None;
    for _ in 0..map_len {
        let key = decode_text(dec, limits)?;
        match key {
            "nonce" => nonce = Some(dec.u64()?),
            _ => {
                if is_indefinite(dec)? {
                    return Err(ProtoDecodeError::IndefiniteLength);
                }
                dec.skip()?;
            }
        }
    }
    nonce.ok_or(ProtoDecodeError::MissingField("nonce"))
}

fn encode_uuid(enc: &mut Encoder<&mut Vec<u8>>, id: &Uuid) -> Result<(), ProtoEncodeError> {
    let raw = id.to_string();
    enc.str(&raw)?;
    Ok(())
}

fn decode_uuid(
    dec: &mut Decoder,
    limits: &Limits,
    field: &'static str,
) -> Result<Uuid, ProtoDecodeError> {
    let raw = decode_text(dec, limits)?;
    Uuid::parse_str(raw).map_err(|e| ProtoDecodeError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

fn decode_publication_id(
    dec: &mut Decoder,
    limits: &Limits,
) -> Result<PublicationId, ProtoDecodeError> {
    Ok(PublicationId::from_uuid(decode_uuid(
        dec,
        limits,
        "publication_id",
    )?))
}

fn decode_map_len(
    dec: &mut Decoder,
    limits: &Limits,
    depth: usize,
) -> Result<usize, ProtoDecodeError> {
    ensure_depth(limits, depth)?;
    let len = dec.map()?;
    let Some(len) = len else {
        return Err(ProtoDecodeError::IndefiniteLength);
    };
    if len > limits.max_cbor_map_entries as u64 {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_map_entries"));
    }
    usize::try_from(len).map_err(|_| ProtoDecodeError::DecodeLimit("max_cbor_map_entries"))
}

fn decode_text<'a>(dec: &mut Decoder<'a>, limits: &Limits) -> Result<&'a str, ProtoDecodeError> {
    let ty = dec.datatype()?;
    if matches!(ty, Type::StringIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let s = dec.str()?;
    if s.len() > limits.max_cbor_text_string_len {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_text_string_len"));
    }
    Ok(s)
}

fn decode_bytes<'a>(
    dec: &mut Decoder<'a>,
    limits: &Limits,
    field: &'static str,
) -> Result<&'a [u8], ProtoDecodeError> {
    let ty = dec.datatype()?;
    if matches!(ty, Type::BytesIndef) {
        return Err(ProtoDecodeError::IndefiniteLength);
    }
    let bytes = dec.bytes()?;
    if bytes.len() > limits.max_payload_bytes {
        return Err(ProtoDecodeError::InvalidField {
            field,
            reason: "bytes length exceeds max_payload_bytes".into(),
        });
    }
    Ok(bytes)
}

fn decode_u32(dec: &mut Decoder, field: &'static str) -> Result<u32, ProtoDecodeError> {
    let value = dec.u64()?;
    u32::try_from(value).map_err(|_| ProtoDecodeError::InvalidField {
        field,
        reason: "out of u32 range".into(),
    })
}

fn is_indefinite(dec: &Decoder) -> Result<bool, ProtoDecodeError> {
    let ty = dec.datatype()?;
    Ok(matches!(
        ty,
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef
    ))
}

fn ensure_depth(limits: &Limits, depth: usize) -> Result<(), ProtoDecodeError> {
    if depth > limits.max_cbor_depth {
        return Err(ProtoDecodeError::DecodeLimit("max_cbor_depth"));
    }
    Ok(())
}
