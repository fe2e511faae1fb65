//! Compute-call identity: service, method, and canonical argument digest.
//!
//! Two calls share a cache entry exactly when their fingerprints are equal.
//! The argument digest is a SHA-256 over a canonical JSON encoding (object
//! keys sorted recursively, no insignificant whitespace), so equal argument
//! values fingerprint identically regardless of map iteration order.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::core::error::{CoreError, InvalidId};

const MAX_ID_LEN: usize = 120;

/// Names a compute service, e.g. `kv` or `cart`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidId> {
        let raw = raw.into();
        match validate_id(&raw) {
            Ok(()) => Ok(Self(raw)),
            Err(reason) => Err(InvalidId::Service { raw, reason }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Names one compute operation within a service, e.g. `get` or `count`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(String);

impl MethodId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidId> {
        let raw = raw.into();
        match validate_id(&raw) {
            Ok(()) => Ok(Self(raw)),
            Err(reason) => Err(InvalidId::Method { raw, reason }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn validate_id(raw: &str) -> Result<(), String> {
    if raw.is_empty() {
        return Err("must not be empty".to_string());
    }
    if raw.len() > MAX_ID_LEN {
        return Err(format!("must be at most {MAX_ID_LEN} bytes"));
    }
    if !raw.chars().all(|c| c.is_ascii_graphic()) {
        return Err("must be printable ascii without whitespace".to_string());
    }
    Ok(())
}

/// SHA-256 of the canonical JSON encoding of a compute call's arguments.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArgsDigest([u8; 32]);

impl ArgsDigest {
    pub fn of<A: Serialize + ?Sized>(args: &A) -> Result<Self, CoreError> {
        let bytes = canonical_json_bytes(args)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        Ok(Self(hasher.finalize().into()))
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl fmt::Display for ArgsDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ArgsDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArgsDigest({})", self.to_hex())
    }
}

/// Cache key for one memoized compute call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    service: ServiceId,
    method: MethodId,
    digest: ArgsDigest,
}

impl Fingerprint {
    pub fn new(service: ServiceId, method: MethodId, digest: ArgsDigest) -> Self {
        Self {
            service,
            method,
            digest,
        }
    }

    pub fn compute<A: Serialize + ?Sized>(
        service: &ServiceId,
        method: &MethodId,
        args: &A,
    ) -> Result<Self, CoreError> {
        Ok(Self {
            service: service.clone(),
            method: method.clone(),
            digest: ArgsDigest::of(args)?,
        })
    }

    pub fn service(&self) -> &ServiceId {
        &self.service
    }

    pub fn method(&self) -> &MethodId {
        &self.method
    }

    pub fn digest(&self) -> &ArgsDigest {
        &self.digest
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.digest.to_hex();
        write!(f, "{}.{}:{}", self.service, self.method, &hex[..16])
    }
}

/// Canonical JSON bytes for an argument value.
///
/// Non-finite floats follow serde_json and encode as `null`.
pub fn canonical_json_bytes<A: Serialize + ?Sized>(args: &A) -> Result<Vec<u8>, CoreError> {
    let value = serde_json::to_value(args).map_err(|e| CoreError::ArgsNotEncodable {
        reason: e.to_string(),
    })?;
    let mut out = Vec::new();
    write_canonical(&value, &mut out).map_err(|e| CoreError::ArgsNotEncodable {
        reason: e.to_string(),
    })?;
    Ok(out)
}

fn write_canonical(value: &serde_json::Value, out: &mut Vec<u8>) -> Result<(), serde_json::Error> {
    use serde_json::Value;
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            serde_json::to_writer(&mut *out, value)
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
            Ok(())
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (i, (key, item)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, key)?;
                out.push(b':');
                write_canonical(item, out)?;
            }
            out.push(b'}');
            Ok(())
        }
    }
}
