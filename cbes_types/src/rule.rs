use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A whitelist/rename/inject projection applied to a mutation's decoded
/// body before it becomes an index request's document body (`spec.md`
/// §4.4).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocStructure {
    /// If non-empty, only these top-level fields are kept.
    pub whitelist: Vec<String>,
    /// Renames applied after whitelisting: source field -> output field.
    pub rename: HashMap<String, String>,
    /// Literal metadata fields injected into the output document, e.g.
    /// `{"type": "user"}`.
    pub inject: HashMap<String, serde_json::Value>,
}

/// A declarative match rule loaded from config. Rules are evaluated
/// first-match-wins against a replication event's document key
/// (`spec.md` §3, §4.4).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeRule {
    /// Glob pattern (`*` / `?`) matched against the document key.
    pub key_pattern: String,
    pub index_name: String,
    #[serde(default)]
    pub routing: Option<String>,
    #[serde(default)]
    pub pipeline: Option<String>,
    #[serde(default)]
    pub ignore: bool,
    #[serde(default)]
    pub ignore_deletes: bool,
    /// Template for the output document id, e.g. `"{type}::{key}"`. Empty
    /// means "use the source key unchanged".
    #[serde(default)]
    pub doc_id_format: String,
    pub type_name: String,
    #[serde(default)]
    pub doc_structure: DocStructure,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_with_sparse_optional_fields_camel_case() {
        let json = r#"{"keyPattern":"user::*","indexName":"users","typeName":"user"}"#;
        let rule: TypeRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.key_pattern, "user::*");
        assert!(!rule.ignore);
        assert!(!rule.ignore_deletes);
        assert!(rule.routing.is_none());
        assert_eq!(rule.doc_structure, DocStructure::default());
    }
}
