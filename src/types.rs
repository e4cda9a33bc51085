/// Common types used throughout the synchronization engine.
///
/// These are the records that cross the engine boundary: the current-state
/// [`Entity`], the immutable [`ChangelogEntry`], and the client-submitted
/// [`MutationOp`] batch. Field names follow the wire format (snake_case) and
/// also accept the camelCase spellings older clients send.
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::str::FromStr;

/// A fully-qualified entity key: namespace, type and id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// The namespace (one tournament, one player lobby, ...)
    pub namespace: String,
    /// Domain type of the entity (e.g. "score", "team")
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Identifier within the type
    pub id: String,
}

impl EntityKey {
    /// Create a new fully-qualified key.
    pub fn new(
        namespace: impl Into<String>,
        entity_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.entity_type, self.id)
    }
}

/// Current state of one domain object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub namespace: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: String,
    /// Opaque payload as submitted by the client
    pub data: JsonValue,
    /// Wall-clock milliseconds of the last accepted write; never decreases
    pub updated_at: i64,
    /// Client that performed the last accepted write
    pub updated_by: String,
}

impl Entity {
    /// The key this entity is stored under.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.namespace, &self.entity_type, &self.id)
    }
}

/// Kind of operation recorded in a mutation or changelog entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Upsert,
    Delete,
}

impl Op {
    /// The stored/wire spelling of this operation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Upsert => "upsert",
            Op::Delete => "delete",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Op {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upsert" => Ok(Op::Upsert),
            "delete" => Ok(Op::Delete),
            other => Err(format!("unknown op '{}'", other)),
        }
    }
}

/// An immutable record of one accepted operation.
///
/// `version` is drawn from the process-wide sequence, so the versions visible
/// in one namespace are strictly increasing but not contiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub namespace: String,
    pub version: i64,
    pub client_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub op: Op,
    /// Payload for upserts; omitted for deletes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

/// One client-submitted operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationOp {
    pub op: Op,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    /// `updated_at` the client last observed; 0 when it believes the entity is new
    #[serde(default, alias = "baseUpdatedAt")]
    pub base_updated_at: i64,
}

impl MutationOp {
    /// Build an upsert operation.
    pub fn upsert(
        entity_type: impl Into<String>,
        id: impl Into<String>,
        data: JsonValue,
        base_updated_at: i64,
    ) -> Self {
        Self {
            op: Op::Upsert,
            entity_type: entity_type.into(),
            id: id.into(),
            data: Some(data),
            base_updated_at,
        }
    }

    /// Build a delete operation.
    pub fn delete(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            op: Op::Delete,
            entity_type: entity_type.into(),
            id: id.into(),
            data: None,
            base_updated_at: 0,
        }
    }

    /// Set the base timestamp used for the optimistic-concurrency check.
    pub fn with_base(mut self, base_updated_at: i64) -> Self {
        self.base_updated_at = base_updated_at;
        self
    }
}

/// Body of `POST /v1/mutate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutateRequest {
    #[serde(alias = "clientId")]
    pub client_id: String,
    #[serde(default)]
    pub mutations: Vec<MutationOp>,
}

/// An operation dropped by the conflict rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRef {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub id: String,
}

/// Result of applying one mutation batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationOutcome {
    /// Current global version after the batch committed
    pub version: i64,
    /// Number of operations that took effect (one changelog entry each)
    pub applied: usize,
    /// Operations discarded because the server held a newer row
    pub conflicts: Vec<ConflictRef>,
}

/// Response of the pull path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Cursor to pass as `since` on the next call
    pub version: i64,
    pub changes: Vec<ChangelogEntry>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match JsonValue::deserialize(deserializer)? {
        JsonValue::String(s) => Ok(s),
        JsonValue::Number(n) => Ok(n.to_string()),
        JsonValue::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}
