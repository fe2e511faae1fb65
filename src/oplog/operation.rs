//! Committed-operation records.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::InvalidId;

/// Identifies one running process instance. Carried on every operation row
/// and on every notify payload so peers can tell local from remote commits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, InvalidId> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(InvalidId::Agent {
                raw,
                reason: "must not be empty".to_string(),
            });
        }
        if raw.len() > 120 || !raw.chars().all(|c| c.is_ascii_graphic()) {
            return Err(InvalidId::Agent {
                raw,
                reason: "must be printable ascii, at most 120 bytes".to_string(),
            });
        }
        Ok(Self(raw))
    }

    /// A fresh process-unique agent id.
    pub fn generate() -> Self {
        Self(format!("agent-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one committed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(raw: Uuid) -> Self {
        Self(raw)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Serialized command: a type discriminator plus its JSON body. The watcher
/// routes on `kind` to re-run the Invalidate phase on remote processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub kind: String,
    pub body: Value,
}

/// One row of the durable operation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    pub agent_id: AgentId,
    pub start_time_ms: u64,
    /// Zero until the row is persisted.
    pub commit_time_ms: u64,
    pub command: CommandEnvelope,
    /// Values stashed during Execute for the Invalidate pass; they travel
    /// with the row so remote watchers see them too.
    pub items: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_validation() {
        assert!(AgentId::parse("agent-1").is_ok());
        assert!(AgentId::parse("").is_err());
        assert!(AgentId::parse("has space").is_err());
        let generated = AgentId::generate();
        assert!(AgentId::parse(generated.as_str()).is_ok());
        assert_ne!(AgentId::generate(), AgentId::generate());
    }

    #[test]
    fn operation_serializes_with_items() {
        let mut items = BTreeMap::new();
        items.insert("existed".to_string(), Value::Bool(true));
        let op = Operation {
            id: OperationId::generate(),
            agent_id: AgentId::parse("agent-1").unwrap(),
            start_time_ms: 5,
            commit_time_ms: 9,
            command: CommandEnvelope {
                kind: "kv.set".to_string(),
                body: serde_json::json!({"key": "a", "value": "v1"}),
            },
            items,
        };
        let json = serde_json::to_string(&op).unwrap();
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }
}
