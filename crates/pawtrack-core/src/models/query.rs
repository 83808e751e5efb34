//! Queries over a collection

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Collection, Entity, Fields};

/// Equality filter on a top-level field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub equals: Value,
}

/// A subscribable selection of one collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: Collection,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FieldFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Query {
    pub const fn collection(collection: Collection) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            limit: None,
        }
    }

    #[must_use]
    pub fn where_eq(mut self, field: impl Into<String>, equals: impl Into<Value>) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            equals: equals.into(),
        });
        self
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches_fields(&self, fields: &Fields) -> bool {
        self.filters.iter().all(|filter| {
            fields
                .get(&filter.field)
                .is_some_and(|value| *value == filter.equals)
        })
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        entity.collection == self.collection && self.matches_fields(&entity.fields)
    }
}
