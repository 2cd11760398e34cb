//! Core data models used throughout the store.
//!
//! These types represent the records, relationship edges, and provenance
//! keys that flow through the sync pipeline and the record managers.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::metadata::Metadata;

/// Timestamps are kept at microsecond precision so that values survive a
/// round trip through every storage backend unchanged.
pub fn normalize_ts(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(6)
}

pub fn now() -> DateTime<Utc> {
    normalize_ts(Utc::now())
}

/// The next timestamp strictly after `prev`, and no earlier than now.
pub fn next_ts(prev: DateTime<Utc>) -> DateTime<Utc> {
    let bumped = prev + chrono::Duration::microseconds(1);
    now().max(bumped)
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RecordType {
    Document,
    CollectionHeader,
    Tag,
    Profile,
    Analytics,
    /// Reserved: sync checkpoint state.
    Checkpoint,
    /// Reserved: single-flight sync lease.
    SyncLock,
    Custom(String),
}

impl RecordType {
    pub fn as_str(&self) -> &str {
        match self {
            RecordType::Document => "document",
            RecordType::CollectionHeader => "collection_header",
            RecordType::Tag => "tag",
            RecordType::Profile => "profile",
            RecordType::Analytics => "analytics",
            RecordType::Checkpoint => "checkpoint",
            RecordType::SyncLock => "sync_lock",
            RecordType::Custom(name) => name.as_str(),
        }
    }

    /// Reserved types hold engine bookkeeping and are hidden from default scans.
    pub fn is_reserved(&self) -> bool {
        matches!(self, RecordType::Checkpoint | RecordType::SyncLock)
    }
}

impl FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "document" => RecordType::Document,
            "collection_header" => RecordType::CollectionHeader,
            "tag" => RecordType::Tag,
            "profile" => RecordType::Profile,
            "analytics" => RecordType::Analytics,
            "checkpoint" => RecordType::Checkpoint,
            "sync_lock" => RecordType::SyncLock,
            "" => return Err("record type must not be empty".to_string()),
            other => RecordType::Custom(other.to_string()),
        })
    }
}

impl TryFrom<String> for RecordType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RecordType> for String {
    fn from(t: RecordType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Draft,
    Published,
    Archived,
    Deleted,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Draft => "draft",
            RecordStatus::Published => "published",
            RecordStatus::Archived => "archived",
            RecordStatus::Deleted => "deleted",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(RecordStatus::Draft),
            "published" => Ok(RecordStatus::Published),
            "archived" => Ok(RecordStatus::Archived),
            "deleted" => Ok(RecordStatus::Deleted),
            other => Err(format!("unknown record status: '{}'", other)),
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Edge type. The closed set plus a `custom:<name>` namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RelationshipType {
    Parent,
    Child,
    Related,
    Reference,
    Contains,
    MemberOf,
    Custom(String),
}

impl RelationshipType {
    pub fn custom(name: impl Into<String>) -> Self {
        RelationshipType::Custom(name.into())
    }
}

impl fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationshipType::Parent => f.write_str("parent"),
            RelationshipType::Child => f.write_str("child"),
            RelationshipType::Related => f.write_str("related"),
            RelationshipType::Reference => f.write_str("reference"),
            RelationshipType::Contains => f.write_str("contains"),
            RelationshipType::MemberOf => f.write_str("member_of"),
            RelationshipType::Custom(name) => write!(f, "custom:{}", name),
        }
    }
}

impl FromStr for RelationshipType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parent" => Ok(RelationshipType::Parent),
            "child" => Ok(RelationshipType::Child),
            "related" => Ok(RelationshipType::Related),
            "reference" => Ok(RelationshipType::Reference),
            "contains" => Ok(RelationshipType::Contains),
            "member_of" => Ok(RelationshipType::MemberOf),
            other => match other.strip_prefix("custom:") {
                Some(name) if !name.is_empty() => Ok(RelationshipType::Custom(name.to_string())),
                _ => Err(format!(
                    "unknown relationship type: '{}' (custom types use 'custom:<name>')",
                    other
                )),
            },
        }
    }
}

impl TryFrom<String> for RelationshipType {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RelationshipType> for String {
    fn from(t: RelationshipType) -> Self {
        t.to_string()
    }
}

/// A typed, directed edge to another record.
///
/// The target may not exist yet (out-of-order creation during a sync) or
/// may be tombstoned; resolution happens lazily at read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub target_unique_id: String,
    #[serde(rename = "type")]
    pub rel_type: RelationshipType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    /// Order within a collection; only meaningful on `member_of` edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
}

impl Relationship {
    pub fn new(target_unique_id: impl Into<String>, rel_type: RelationshipType) -> Self {
        Self {
            target_unique_id: target_unique_id.into(),
            rel_type,
            title: None,
            metadata: Metadata::new(),
            position: None,
        }
    }

    pub fn member_of(header_id: impl Into<String>, position: Option<i64>) -> Self {
        Self {
            position,
            ..Self::new(header_id, RelationshipType::MemberOf)
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Two edges are the same edge when target and type match.
    pub fn same_edge(&self, other: &Relationship) -> bool {
        self.target_unique_id == other.target_unique_id && self.rel_type == other.rel_type
    }
}

/// One configured source instance, e.g. `filesystem:notes`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceKey {
    pub source_type: String,
    pub source_identity: String,
}

impl SourceKey {
    pub fn new(source_type: impl Into<String>, source_identity: impl Into<String>) -> Self {
        Self {
            source_type: source_type.into(),
            source_identity: source_identity.into(),
        }
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source_type, self.source_identity)
    }
}

/// Where a synced record came from. `external_id` is unique within its source.
///
/// `source_modified_at` is the source's own modification time for the
/// version last written. The sync diff compares against it, so local edits
/// (which advance the record's `updated_at`) never hide a source change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Provenance {
    pub source_type: String,
    pub source_identity: String,
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_modified_at: Option<DateTime<Utc>>,
}

impl Provenance {
    pub fn new(key: &SourceKey, external_id: impl Into<String>) -> Self {
        Self {
            source_type: key.source_type.clone(),
            source_identity: key.source_identity.clone(),
            external_id: external_id.into(),
            source_modified_at: None,
        }
    }

    pub fn with_source_modified_at(mut self, ts: DateTime<Utc>) -> Self {
        self.source_modified_at = Some(normalize_ts(ts));
        self
    }

    pub fn key(&self) -> SourceKey {
        SourceKey::new(&self.source_type, &self.source_identity)
    }

    pub fn belongs_to(&self, key: &SourceKey) -> bool {
        self.source_type == key.source_type && self.source_identity == key.source_identity
    }

    /// Same source and external id, whatever version each side saw.
    pub fn same_item(&self, other: &Provenance) -> bool {
        self.external_id == other.external_id
            && self.source_type == other.source_type
            && self.source_identity == other.source_identity
    }

    /// The `unique_id` a record synced from this item gets on creation.
    ///
    /// Derived from the provenance key alone, so an adapter can point an
    /// edge at an item that has not been synced yet.
    pub fn unique_id(&self) -> String {
        let name = format!(
            "{}\0{}\0{}",
            self.source_type, self.source_identity, self.external_id
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}",
            self.source_type, self.source_identity, self.external_id
        )
    }
}

/// A stored document with metadata, optional embedding, and relationships.
///
/// `collection` is a cache derived from the record's `member_of` edge and
/// can only change by changing that edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub unique_id: String,
    pub title: String,
    pub text_content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub custom_metadata: Metadata,
    pub tags: BTreeSet<String>,
    pub relationships: Vec<Relationship>,
    collection: Option<String>,
    pub record_type: RecordType,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub provenance: Option<Provenance>,
    /// Store-managed write counter used for optimistic concurrency.
    pub revision: u64,
}

impl Record {
    /// A new unsaved document record. `unique_id` is assigned on upsert.
    pub fn new(title: impl Into<String>, text_content: impl Into<String>) -> Self {
        let ts = now();
        Self {
            unique_id: String::new(),
            title: title.into(),
            text_content: text_content.into(),
            embedding: None,
            custom_metadata: Metadata::new(),
            tags: BTreeSet::new(),
            relationships: Vec::new(),
            collection: None,
            record_type: RecordType::Document,
            status: RecordStatus::Published,
            created_at: ts,
            updated_at: ts,
            provenance: None,
            revision: 0,
        }
    }

    pub fn with_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = unique_id.into();
        self
    }

    pub fn with_type(mut self, record_type: RecordType) -> Self {
        self.record_type = record_type;
        self
    }

    pub fn with_status(mut self, status: RecordStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.custom_metadata.insert(key, value);
        self
    }

    pub fn with_relationship(mut self, rel: Relationship) -> Self {
        self.relationships.push(rel);
        self.refresh_collection();
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn with_updated_at(mut self, ts: DateTime<Utc>) -> Self {
        self.updated_at = normalize_ts(ts);
        self
    }

    pub fn with_created_at(mut self, ts: DateTime<Utc>) -> Self {
        self.created_at = normalize_ts(ts);
        self
    }

    pub fn collection(&self) -> Option<&str> {
        self.collection.as_deref()
    }

    pub fn is_tombstoned(&self) -> bool {
        self.status == RecordStatus::Deleted
    }

    pub fn member_of_edge(&self) -> Option<&Relationship> {
        self.relationships
            .iter()
            .find(|r| r.rel_type == RelationshipType::MemberOf)
    }

    /// Recompute the cached `collection` from the `member_of` edge.
    pub fn refresh_collection(&mut self) {
        self.collection = self.member_of_edge().map(|r| r.target_unique_id.clone());
    }

    /// Advance `updated_at` for a local mutation.
    pub fn touch(&mut self) {
        self.updated_at = next_ts(self.updated_at);
    }

    /// Bring the record into canonical form: microsecond timestamps, no
    /// duplicate edges, at most one `member_of` edge (the first), and a
    /// fresh `collection` cache.
    pub fn normalize(&mut self) {
        self.created_at = normalize_ts(self.created_at);
        self.updated_at = normalize_ts(self.updated_at);

        let mut kept: Vec<Relationship> = Vec::with_capacity(self.relationships.len());
        let mut seen_member_of = false;
        for rel in self.relationships.drain(..) {
            if kept.iter().any(|k| k.same_edge(&rel)) {
                continue;
            }
            if rel.rel_type == RelationshipType::MemberOf {
                if seen_member_of {
                    tracing::warn!(
                        header = %rel.target_unique_id,
                        "dropping extra member_of edge; a record belongs to one collection"
                    );
                    continue;
                }
                seen_member_of = true;
            }
            kept.push(rel);
        }
        self.relationships = kept;
        self.refresh_collection();
    }

    /// Hash of everything a caller controls, excluding identity,
    /// timestamps, and the store-managed revision.
    pub fn content_hash(&self) -> String {
        let content = (
            &self.title,
            &self.text_content,
            &self.embedding,
            &self.custom_metadata,
            &self.tags,
            &self.relationships,
            &self.record_type,
            &self.status,
            &self.provenance,
        );
        let bytes = serde_json::to_vec(&content).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }
}

/// A record paired with a similarity score from vector search.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredRecord {
    pub record: Record,
    pub score: f32,
}
