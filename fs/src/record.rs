//! Record trait and index types

use std::collections::HashMap;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A value stored in a record's secondary index
#[derive(Debug, Clone, PartialEq)]
pub enum IndexValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl IndexValue {
    /// String form used for display and filter comparison
    pub fn as_display(&self) -> String {
        match self {
            IndexValue::String(s) => s.clone(),
            IndexValue::Int(i) => i.to_string(),
            IndexValue::Bool(b) => b.to_string(),
        }
    }
}

impl From<&str> for IndexValue {
    fn from(s: &str) -> Self {
        IndexValue::String(s.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(s: String) -> Self {
        IndexValue::String(s)
    }
}

impl From<i64> for IndexValue {
    fn from(i: i64) -> Self {
        IndexValue::Int(i)
    }
}

impl From<bool> for IndexValue {
    fn from(b: bool) -> Self {
        IndexValue::Bool(b)
    }
}

/// Comparison operator for filters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
}

/// A filter over an indexed field
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: IndexValue,
}

impl Filter {
    /// Equality filter
    pub fn eq(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    /// Inequality filter
    pub fn ne(field: impl Into<String>, value: impl Into<IndexValue>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Ne,
            value: value.into(),
        }
    }

    /// Check whether an index entry satisfies this filter
    pub fn matches(&self, fields: &HashMap<String, IndexValue>) -> bool {
        let actual = fields.get(&self.field);
        match self.op {
            FilterOp::Eq => actual == Some(&self.value),
            FilterOp::Ne => actual != Some(&self.value),
        }
    }
}

/// A persistable domain record
///
/// Records serialize to JSON documents; `indexed_fields` declares the
/// fields available to [`Filter`] queries.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + 'static {
    /// Unique identifier within the collection
    fn id(&self) -> &str;

    /// Last update timestamp (Unix milliseconds)
    fn updated_at(&self) -> i64;

    /// Collection this record type lives in
    fn collection_name() -> &'static str;

    /// Fields exposed to filtered queries
    fn indexed_fields(&self) -> HashMap<String, IndexValue>;
}
