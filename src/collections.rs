//! Collection Manager.
//!
//! A collection is a header record (`record_type = collection_header`) plus
//! the records that carry a `member_of` edge to it. The edge is canonical;
//! a member's `collection` field is only a cache recomputed from it.
//!
//! Positions live on the `member_of` edge. Position changes for one header
//! are serialized through a per-header async mutex, and each member write
//! is still guarded by the store's revision check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use crate::error::{CollectionError, StoreError};
use crate::metadata::Metadata;
use crate::models::{Record, RecordType, Relationship, RelationshipType};
use crate::records::RecordManager;
use crate::store::RecordFilter;

type HeaderLocks = Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>;

pub struct CollectionManager {
    records: RecordManager,
    header_locks: HeaderLocks,
}

/// Holds one header's mutex. Dropping it also drops the map entry once no
/// other task holds or waits for that header.
struct HeaderGuard<'a> {
    locks: &'a HeaderLocks,
    header_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for HeaderGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(&self.header_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.header_id);
        }
    }
}

/// The position a record holds in `header_id`, if it is a member there.
fn member_position(record: &Record, header_id: &str) -> Option<Option<i64>> {
    record
        .member_of_edge()
        .filter(|edge| edge.target_unique_id == header_id)
        .map(|edge| edge.position)
}

impl CollectionManager {
    pub fn new(records: RecordManager) -> Self {
        Self {
            records,
            header_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn records(&self) -> &RecordManager {
        &self.records
    }

    pub async fn create_header(
        &self,
        title: impl Into<String>,
        metadata: Metadata,
    ) -> Result<Record, CollectionError> {
        let mut header = Record::new(title, "").with_type(RecordType::CollectionHeader);
        header.custom_metadata = metadata;
        Ok(self.records.upsert(header).await?.into_record())
    }

    async fn header(&self, header_id: &str) -> Result<Record, CollectionError> {
        let header = self
            .records
            .get(header_id)
            .await?
            .filter(|h| !h.is_tombstoned())
            .ok_or_else(|| CollectionError::HeaderMissing(header_id.to_string()))?;
        if header.record_type != RecordType::CollectionHeader {
            return Err(CollectionError::NotAHeader(header_id.to_string()));
        }
        Ok(header)
    }

    async fn lock_header(&self, header_id: &str) -> HeaderGuard<'_> {
        let lock = {
            let mut locks = self
                .header_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            locks
                .entry(header_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        HeaderGuard {
            locks: &self.header_locks,
            header_id: header_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    fn tracked_headers(&self) -> usize {
        self.header_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Add `record_id` to the collection, moving it out of any other one.
    ///
    /// With a position, an occupied slot pushes that member and every later
    /// one down by one. Without a position, an existing membership in this
    /// header is left as is.
    pub async fn add_member(
        &self,
        header_id: &str,
        record_id: &str,
        position: Option<i64>,
    ) -> Result<Record, CollectionError> {
        self.header(header_id).await?;
        let _guard = self.lock_header(header_id).await;

        if let Some(pos) = position {
            self.open_slot(header_id, record_id, pos).await?;
        }

        let record = self
            .records
            .modify(record_id, |record| {
                match member_position(record, header_id) {
                    Some(current) if position.is_none() || current == position => return false,
                    _ => {}
                }
                record
                    .relationships
                    .retain(|r| r.rel_type != RelationshipType::MemberOf);
                record
                    .relationships
                    .push(Relationship::member_of(header_id, position));
                true
            })
            .await?;

        tracing::debug!(header = header_id, member = record_id, ?position, "collection member set");
        Ok(record)
    }

    /// Make room at `pos`, if another member holds it.
    async fn open_slot(
        &self,
        header_id: &str,
        record_id: &str,
        pos: i64,
    ) -> Result<(), CollectionError> {
        let members = self
            .records
            .store()
            .scan(&RecordFilter::for_collection(header_id))
            .await?;

        let occupied = members.iter().any(|m| {
            m.unique_id != record_id && member_position(m, header_id) == Some(Some(pos))
        });
        if !occupied {
            return Ok(());
        }

        for member in members.iter().filter(|m| m.unique_id != record_id) {
            match member_position(member, header_id) {
                Some(Some(p)) if p >= pos => {}
                _ => continue,
            }
            self.records
                .modify(&member.unique_id, |record| {
                    let edge = record.relationships.iter_mut().find(|r| {
                        r.rel_type == RelationshipType::MemberOf && r.target_unique_id == header_id
                    });
                    match edge {
                        Some(Relationship {
                            position: Some(p), ..
                        }) if *p >= pos => {
                            *p += 1;
                            true
                        }
                        _ => false,
                    }
                })
                .await?;
        }
        Ok(())
    }

    /// Reposition an existing member.
    pub async fn move_member(
        &self,
        header_id: &str,
        record_id: &str,
        position: i64,
    ) -> Result<Record, CollectionError> {
        let record = self
            .records
            .get(record_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(record_id.to_string()))?;
        if member_position(&record, header_id).is_none() {
            return Err(CollectionError::NotAMember {
                header: header_id.to_string(),
                record: record_id.to_string(),
            });
        }
        self.add_member(header_id, record_id, Some(position)).await
    }

    pub async fn remove_member(
        &self,
        header_id: &str,
        record_id: &str,
    ) -> Result<Record, CollectionError> {
        let _guard = self.lock_header(header_id).await;

        let record = self
            .records
            .get(record_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(record_id.to_string()))?;
        if member_position(&record, header_id).is_none() {
            return Err(CollectionError::NotAMember {
                header: header_id.to_string(),
                record: record_id.to_string(),
            });
        }

        Ok(self
            .records
            .remove_relationship(record_id, header_id, &RelationshipType::MemberOf)
            .await?)
    }

    /// Live members, ordered by position; members without a position follow
    /// in creation order.
    ///
    /// Tombstoned members are left out even though their `member_of` edge
    /// and cached `collection` still name this header, so reviving one puts
    /// it back in its old place. Scan with
    /// [`RecordFilter::for_collection`] and `include_deleted` to see them.
    pub async fn list_members(&self, header_id: &str) -> Result<Vec<Record>, CollectionError> {
        self.header(header_id).await?;

        let mut members = self
            .records
            .store()
            .scan(&RecordFilter::for_collection(header_id))
            .await?;
        // Stable: ties keep the scan's creation order.
        members.sort_by_key(|m| match member_position(m, header_id).flatten() {
            Some(p) => (0, p),
            None => (1, 0),
        });
        Ok(members)
    }
}
