//! # Task Message Structures
//!
//! Wire format shared by the producer and the channel workers:
//!
//! ```json
//! {"id": "…", "tipo": "hemograma", "dados": {…}, "prioridade": 0, "timestamp": "…"}
//! ```
//!
//! Type-specific fields (`paciente`, `solicitante`, …) live next to the
//! envelope fields; `dados` is the generic field bag for types without a fixed
//! schema. Both end up in [`Task::payload`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::errors::{MessagingError, MessagingResult};
use crate::routing::{RoutingError, TaskKind};

/// Generic payload field for task types without a fixed schema
pub const DATA_FIELD: &str = "dados";

/// Wire keys owned by the envelope; a payload field may not reuse them
pub const ENVELOPE_FIELDS: [&str; 4] = ["id", "tipo", "prioridade", "timestamp"];

/// Identifier of one publish attempt, carried as the AMQP `message_id` property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh message ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for MessageId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// A unit of work routed to exactly one channel
///
/// `id` identifies the logical task for its whole life; `message_id` is only
/// known on the consumer side and identifies the publish attempt that
/// produced the delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,

    #[serde(rename = "tipo")]
    pub task_type: String,

    #[serde(rename = "prioridade", default, deserialize_with = "nullable_priority")]
    pub priority: i32,

    #[serde(rename = "timestamp", with = "wire_timestamp")]
    pub created_at: DateTime<Utc>,

    #[serde(flatten)]
    pub payload: Map<String, Value>,

    #[serde(skip)]
    pub message_id: Option<MessageId>,
}

impl Task {
    /// Parse the task type into the closed set of known kinds
    pub fn kind(&self) -> Result<TaskKind, RoutingError> {
        self.task_type.parse()
    }

    /// The generic `dados` field bag, if present
    pub fn data(&self) -> Option<&Value> {
        self.payload.get(DATA_FIELD)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    /// Serialize to the JSON wire body
    ///
    /// Fails if a payload field collides with an envelope key, since the
    /// resulting body would carry that key twice and never decode.
    pub fn to_bytes(&self) -> MessagingResult<Vec<u8>> {
        if let Some(key) = ENVELOPE_FIELDS
            .iter()
            .find(|key| self.payload.contains_key(**key))
        {
            return Err(MessagingError::message_serialization(format!(
                "payload field '{key}' collides with the task envelope"
            )));
        }
        serde_json::to_vec(self).map_err(|e| MessagingError::message_serialization(e.to_string()))
    }

    /// Decode a wire body, attaching the delivery's `message_id` property if any
    pub fn decode(body: &[u8], message_id: Option<&str>) -> MessagingResult<Self> {
        let mut task: Task = serde_json::from_slice(body)
            .map_err(|e| MessagingError::message_deserialization(e.to_string()))?;

        if task.task_type.is_empty() {
            return Err(MessagingError::message_deserialization(
                "task type ('tipo') is empty",
            ));
        }

        task.message_id = message_id.and_then(|raw| raw.parse().ok());
        Ok(task)
    }
}

/// Producer-side task input; `id` and `created_at` are filled in on publish
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    #[serde(rename = "tipo")]
    pub task_type: String,

    #[serde(rename = "prioridade", default, deserialize_with = "nullable_priority")]
    pub priority: i32,

    #[serde(
        rename = "timestamp",
        default,
        skip_serializing_if = "Option::is_none",
        with = "wire_timestamp::option"
    )]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            ..Default::default()
        }
    }

    /// Build a request from a wire-shaped JSON object
    pub fn from_json(value: Value) -> MessagingResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| MessagingError::message_deserialization(e.to_string()))
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Set the generic `dados` field bag
    pub fn with_data(self, data: Value) -> Self {
        self.with_field(DATA_FIELD, data)
    }

    /// Set a type-specific top-level field
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.payload.insert(name.into(), value);
        self
    }

    /// Complete the envelope, keeping any identifiers the caller supplied
    pub fn into_task(self, message_id: MessageId) -> Task {
        Task {
            id: self.id.unwrap_or_else(Uuid::new_v4),
            task_type: self.task_type,
            priority: self.priority,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            payload: self.payload,
            message_id: Some(message_id),
        }
    }
}

fn nullable_priority<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<i32>::deserialize(deserializer)?.unwrap_or_default())
}

/// ISO-8601 timestamps on the wire
///
/// Encodes RFC 3339 in UTC. Decoding also accepts naive timestamps without an
/// offset, which are read as UTC.
pub mod wire_timestamp {
    use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    const NAIVE_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

    pub fn format(value: &DateTime<Utc>) -> String {
        value.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| NaiveDateTime::parse_from_str(raw, NAIVE_FORMAT).map(|n| n.and_utc()))
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(|e| D::Error::custom(format!("invalid timestamp '{raw}': {e}")))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(ts) => serializer.serialize_str(&super::format(ts)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| {
                    super::parse(&raw)
                        .map_err(|e| D::Error::custom(format!("invalid timestamp '{raw}': {e}")))
                })
                .transpose()
        }
    }
}
