//! In-memory store engine
//!
//! Collections are maps of id -> (JSON document, index entries). The store is
//! synchronous and single-owner; concurrent access is the caller's concern
//! (the CodeForge core wraps it in a state actor).

use std::collections::HashMap;

use thiserror::Error;

use crate::record::{Filter, IndexValue, Record};

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Duplicate id in {collection}: {id}")]
    Conflict { collection: String, id: String },

    #[error("Record not found in {collection}: {id}")]
    NotFound { collection: String, id: String },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One stored document with its index entries
struct Document {
    body: serde_json::Value,
    fields: HashMap<String, IndexValue>,
    updated_at: i64,
}

/// The in-memory store engine
#[derive(Default)]
pub struct Store {
    collections: HashMap<&'static str, HashMap<String, Document>>,
}

impl Store {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record; fails with `Conflict` if the id already exists
    pub fn create<T: Record>(&mut self, record: &T) -> StoreResult<()> {
        let collection = self.collections.entry(T::collection_name()).or_default();
        if collection.contains_key(record.id()) {
            return Err(StoreError::Conflict {
                collection: T::collection_name().to_string(),
                id: record.id().to_string(),
            });
        }
        collection.insert(record.id().to_string(), Self::encode(record)?);
        Ok(())
    }

    /// Fetch a record by id
    pub fn get<T: Record>(&self, id: &str) -> StoreResult<Option<T>> {
        let Some(collection) = self.collections.get(T::collection_name()) else {
            return Ok(None);
        };
        match collection.get(id) {
            Some(doc) => Ok(Some(Self::decode(doc)?)),
            None => Ok(None),
        }
    }

    /// Replace an existing record; fails with `NotFound` if absent
    pub fn update<T: Record>(&mut self, record: &T) -> StoreResult<()> {
        let collection = self.collections.entry(T::collection_name()).or_default();
        if !collection.contains_key(record.id()) {
            return Err(StoreError::NotFound {
                collection: T::collection_name().to_string(),
                id: record.id().to_string(),
            });
        }
        collection.insert(record.id().to_string(), Self::encode(record)?);
        Ok(())
    }

    /// Insert or replace a record
    pub fn upsert<T: Record>(&mut self, record: &T) -> StoreResult<()> {
        let collection = self.collections.entry(T::collection_name()).or_default();
        collection.insert(record.id().to_string(), Self::encode(record)?);
        Ok(())
    }

    /// Remove a record; returns whether it existed
    pub fn delete<T: Record>(&mut self, id: &str) -> bool {
        self.collections
            .get_mut(T::collection_name())
            .map(|c| c.remove(id).is_some())
            .unwrap_or(false)
    }

    /// List every record in the collection, oldest update first
    pub fn list<T: Record>(&self) -> StoreResult<Vec<T>> {
        self.find(&[])
    }

    /// List records whose index entries satisfy every filter, oldest update first
    pub fn find<T: Record>(&self, filters: &[Filter]) -> StoreResult<Vec<T>> {
        let Some(collection) = self.collections.get(T::collection_name()) else {
            return Ok(Vec::new());
        };

        let mut docs: Vec<&Document> = collection
            .values()
            .filter(|doc| filters.iter().all(|f| f.matches(&doc.fields)))
            .collect();
        docs.sort_by_key(|doc| doc.updated_at);

        docs.into_iter().map(|doc| Self::decode(doc)).collect()
    }

    /// Number of records in the collection
    pub fn count<T: Record>(&self) -> usize {
        self.collections
            .get(T::collection_name())
            .map(|c| c.len())
            .unwrap_or(0)
    }

    fn encode<T: Record>(record: &T) -> StoreResult<Document> {
        let body = serde_json::to_value(record).map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Document {
            body,
            fields: record.indexed_fields(),
            updated_at: record.updated_at(),
        })
    }

    fn decode<T: Record>(doc: &Document) -> StoreResult<T> {
        serde_json::from_value(doc.body.clone()).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}
