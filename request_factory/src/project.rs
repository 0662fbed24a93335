//! Body projection: whitelist, rename, inject (`spec.md` §4.4).

use cbes_types::TypeRule;
use serde_json::{Map, Value};

/// Decode `body` as a JSON object and apply the rule's
/// [`cbes_types::DocStructure`], plus the event-derived `cas`/`rev`
/// metadata fields the spec calls out as injected alongside the
/// config-driven ones.
pub fn project_body(
    body: &[u8],
    rule: &TypeRule,
    cas: u64,
    rev_seqno: u64,
) -> Result<Vec<u8>, serde_json::Error> {
    let decoded: Value = serde_json::from_slice(body)?;
    let Value::Object(mut fields) = decoded else {
        return Err(serde::de::Error::custom("document body is not a JSON object"));
    };

    if !rule.doc_structure.whitelist.is_empty() {
        fields.retain(|key, _| rule.doc_structure.whitelist.contains(key));
    }

    for (from, to) in &rule.doc_structure.rename {
        if let Some(value) = fields.remove(from) {
            fields.insert(to.clone(), value);
        }
    }

    for (key, value) in &rule.doc_structure.inject {
        fields.insert(key.clone(), value.clone());
    }

    fields.insert("cas".to_string(), Value::from(cas));
    fields.insert("rev".to_string(), Value::from(rev_seqno));

    serde_json::to_vec(&Value::Object(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cbes_types::DocStructure;
    use std::collections::HashMap;

    fn rule_with(structure: DocStructure) -> TypeRule {
        TypeRule {
            key_pattern: "*".to_string(),
            index_name: "docs".to_string(),
            routing: None,
            pipeline: None,
            ignore: false,
            ignore_deletes: false,
            doc_id_format: String::new(),
            type_name: "widget".to_string(),
            doc_structure: structure,
        }
    }

    #[test]
    fn whitelist_drops_unlisted_fields() {
        let structure = DocStructure {
            whitelist: vec!["x".to_string()],
            ..Default::default()
        };
        let out = project_body(br#"{"x":1,"y":2}"#, &rule_with(structure), 9, 1).unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value.get("x"), Some(&Value::from(1)));
        assert_eq!(value.get("y"), None);
    }

    #[test]
    fn rename_moves_field_under_new_key() {
        let mut rename = HashMap::new();
        rename.insert("old".to_string(), "new".to_string());
        let structure = DocStructure {
            rename,
            ..Default::default()
        };
        let out = project_body(br#"{"old":"value"}"#, &rule_with(structure), 1, 1).unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value.get("new"), Some(&Value::from("value")));
        assert_eq!(value.get("old"), None);
    }

    #[test]
    fn inject_adds_literal_fields() {
        let mut inject = HashMap::new();
        inject.insert("type".to_string(), Value::from("user"));
        let structure = DocStructure {
            inject,
            ..Default::default()
        };
        let out = project_body(b"{}", &rule_with(structure), 5, 3).unwrap();
        let value: Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value.get("type"), Some(&Value::from("user")));
        assert_eq!(value.get("cas"), Some(&Value::from(5)));
        assert_eq!(value.get("rev"), Some(&Value::from(3)));
    }

    #[test]
    fn non_object_body_is_an_error() {
        let result = project_body(b"[1,2,3]", &rule_with(DocStructure::default()), 1, 1);
        assert!(result.is_err());
    }
}
