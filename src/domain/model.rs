use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque key/value metadata attached to contexts, messages and versions
pub type Metadata = Map<String, Value>;

/// A named, versioned, append-only log of messages
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Context {
    /// Server-assigned or caller-assigned identifier
    pub id: String,

    /// Metadata associated with this context
    pub metadata: Metadata,

    /// Creation timestamp as sent by the server (RFC 3339)
    pub created_at: Option<String>,
}

impl Context {
    /// Creation time, if present and well-formed
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.created_at.as_deref())
    }
}

/// One entry of a context's log
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Message {
    pub id: String,

    /// Zero-based position within the log at the version it was read
    pub index: Option<u64>,

    pub role: String,

    pub content: String,

    pub metadata: Metadata,
}

/// A message to append; the server assigns its id and index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl NewMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            metadata: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// An edit to an existing message, addressed by id or index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl MessagePatch {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn by_index(index: u64) -> Self {
        Self {
            index: Some(index),
            ..Self::default()
        }
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Audit-trail entry for one mutation of a context
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Version {
    pub version: u64,
    pub created_at: Option<String>,
    pub operation: String,
    /// Identifiers of the messages the operation touched
    pub affected: Vec<String>,
    pub metadata: Option<Metadata>,
}

impl Version {
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(self.created_at.as_deref())
    }
}

/// Outcome of a compress operation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompressionInfo {
    pub strategy: Option<CompressStrategy>,
    /// Number of messages folded away
    pub compressed_messages: u64,
    /// Content size in bytes before compression
    pub original_size: Option<u64>,
    /// Content size in bytes after compression
    pub compressed_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressStrategy {
    /// Replace the range with a summary; originals are retained
    #[default]
    Summarize,
    /// Drop the range; nothing is retained
    Truncate,
    /// Fold the range into a placeholder; lossless
    Archive,
}

impl CompressStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summarize => "summarize",
            Self::Truncate => "truncate",
            Self::Archive => "archive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "summarize" => Some(Self::Summarize),
            "truncate" => Some(Self::Truncate),
            "archive" => Some(Self::Archive),
            _ => None,
        }
    }

    /// Whether uncompress can restore what this strategy removed
    pub fn retains_originals(&self) -> bool {
        !matches!(self, Self::Truncate)
    }
}

/// Scope of a compress operation; `start..end` is a half-open index range
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
    #[serde(default)]
    pub strategy: CompressStrategy,
}

impl CompressOptions {
    pub fn new(strategy: CompressStrategy) -> Self {
        Self {
            start: None,
            end: None,
            strategy,
        }
    }

    pub fn range(mut self, start: u64, end: u64) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }
}

/// Scope of an uncompress operation; no bounds means the whole log
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UncompressOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
}

impl UncompressOptions {
    pub fn range(start: u64, end: u64) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }
}

/// Options for creating a context
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateContextOptions {
    /// Caller-assigned id; the server allocates one when absent
    pub id: Option<String>,
    pub metadata: Option<Metadata>,
}

/// Options for reading a context
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetContextOptions {
    /// Read the log as of this version
    pub version: Option<u64>,
    /// Read the log as of the version that produced this message index
    pub at: Option<u64>,
    /// Read the log as of this timestamp (RFC 3339)
    pub before: Option<String>,
    /// Include the version history in the response
    pub history: bool,
}

impl GetContextOptions {
    pub fn with_history() -> Self {
        Self {
            history: true,
            ..Self::default()
        }
    }

    pub fn at_version(version: u64) -> Self {
        Self {
            version: Some(version),
            ..Self::default()
        }
    }

    /// True when the read targets the past rather than the current head
    pub fn is_historical(&self) -> bool {
        self.version.is_some() || self.at.is_some() || self.before.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CreateContextResponse {
    pub id: String,
    pub metadata: Option<Metadata>,
    pub created_at: Option<String>,
    /// Initial version, when the server reports one
    pub version: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ListContextsResponse {
    pub data: Vec<Context>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GetContextResponse {
    pub data: Vec<Message>,
    pub version: Option<u64>,
    pub versions: Vec<Version>,
}

/// Messages touched by a mutation and the version it produced
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MutationResponse {
    pub data: Vec<Message>,
    pub version: Option<u64>,
}

pub type AppendResponse = MutationResponse;
pub type UpdateResponse = MutationResponse;
pub type DeleteResponse = MutationResponse;
pub type UncompressResponse = MutationResponse;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompressResponse {
    pub data: Vec<Message>,
    pub version: Option<u64>,
    pub compression: CompressionInfo,
}

fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|parsed| parsed.with_timezone(&Utc))
}
