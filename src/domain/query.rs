//! Query identity: the natural key of every anchored proof.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::hasher::canonical_json;

/// The tuple identifying a hashed/anchored query.
///
/// Two identities are equal when all four fields are structurally equal after
/// canonical ordering of map keys, so `{"a":1,"b":2}` and `{"b":2,"a":1}`
/// name the same query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryIdentity {
    /// Document store (database) name
    pub store_name: String,

    /// Collection within the store
    pub collection_name: String,

    /// Filter document
    #[serde(default = "empty_document")]
    pub filter: Value,

    /// Projection document
    #[serde(default = "empty_document")]
    pub projection: Value,
}

fn empty_document() -> Value {
    Value::Object(serde_json::Map::new())
}

impl QueryIdentity {
    /// Create a new identity
    pub fn new(
        store_name: impl Into<String>,
        collection_name: impl Into<String>,
        filter: Value,
        projection: Value,
    ) -> Self {
        Self {
            store_name: store_name.into(),
            collection_name: collection_name.into(),
            filter,
            projection,
        }
    }

    /// Canonical text of the filter document
    pub fn canonical_filter(&self) -> String {
        canonical_json(&self.filter)
    }

    /// Canonical text of the projection document
    pub fn canonical_projection(&self) -> String {
        canonical_json(&self.projection)
    }

    /// Short human-readable label for logs ("store.collection")
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.store_name, self.collection_name)
    }
}

impl PartialEq for QueryIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.store_name == other.store_name
            && self.collection_name == other.collection_name
            && self.canonical_filter() == other.canonical_filter()
            && self.canonical_projection() == other.canonical_projection()
    }
}

impl Eq for QueryIdentity {}

impl fmt::Display for QueryIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} filter={} projection={}",
            self.namespace(),
            self.canonical_filter(),
            self.canonical_projection()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equality_ignores_key_order() {
        let a = QueryIdentity::new("shop", "orders", json!({"a": 1, "b": {"x": 1, "y": 2}}), json!({}));
        let b = QueryIdentity::new("shop", "orders", json!({"b": {"y": 2, "x": 1}, "a": 1}), json!({}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_equality_respects_every_field() {
        let base = QueryIdentity::new("shop", "orders", json!({"status": "paid"}), json!({}));

        let other_store = QueryIdentity::new("shop2", "orders", json!({"status": "paid"}), json!({}));
        let other_projection =
            QueryIdentity::new("shop", "orders", json!({"status": "paid"}), json!({"total": 1}));

        assert_ne!(base, other_store);
        assert_ne!(base, other_projection);
    }

    #[test]
    fn test_deserialize_defaults_documents() {
        let identity: QueryIdentity =
            serde_json::from_str(r#"{"store_name":"shop","collection_name":"orders"}"#).unwrap();
        assert_eq!(identity.filter, json!({}));
        assert_eq!(identity.projection, json!({}));
    }
}
