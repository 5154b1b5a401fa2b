//! Metadata allow-list filtering.
//!
//! Documents carry an arbitrary JSON object of metadata. The relational
//! store keeps all of it; the vector store only mirrors the fields that are
//! useful as search filters. Which fields those are is configuration, and
//! the projection itself is a pure function.

use std::collections::BTreeSet;

use serde_json::Value;

/// Free-form document metadata.
pub type Metadata = serde_json::Map<String, Value>;

/// Fields mirrored into the vector store when no list is configured.
pub const DEFAULT_VECTOR_FIELDS: &[&str] = &[
    "content_type",
    "source_type",
    "language",
    "tags",
    "category",
    "source_url",
];

/// The set of metadata keys that may be copied into vector rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataAllowList {
    fields: BTreeSet<String>,
}

impl MetadataAllowList {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }

    /// Project `metadata` onto the allow-list.
    ///
    /// Keys outside the list are dropped, as are allowed keys whose value is
    /// JSON `null`.
    pub fn filter(&self, metadata: &Metadata) -> Metadata {
        metadata
            .iter()
            .filter(|(key, value)| self.contains(key) && !value.is_null())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl Default for MetadataAllowList {
    fn default() -> Self {
        Self::new(DEFAULT_VECTOR_FIELDS.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Metadata {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_filter_keeps_only_allowed_fields() {
        let allow = MetadataAllowList::new(["content_type"]);
        let filtered = allow.filter(&meta(json!({"content_type": "pdf", "author": "x"})));
        assert_eq!(Value::Object(filtered), json!({"content_type": "pdf"}));
    }

    #[test]
    fn test_filter_drops_null_values() {
        let allow = MetadataAllowList::default();
        let filtered = allow.filter(&meta(json!({"language": null, "tags": ["a", "b"]})));
        assert_eq!(Value::Object(filtered), json!({"tags": ["a", "b"]}));
    }

    #[test]
    fn test_filter_empty_allow_list() {
        let allow = MetadataAllowList::new(Vec::<String>::new());
        assert!(allow.filter(&meta(json!({"content_type": "pdf"}))).is_empty());
    }

    #[test]
    fn test_default_fields() {
        let allow = MetadataAllowList::default();
        assert!(allow.contains("source_url"));
        assert!(!allow.contains("author"));
        assert_eq!(allow.fields().count(), DEFAULT_VECTOR_FIELDS.len());
    }
}
