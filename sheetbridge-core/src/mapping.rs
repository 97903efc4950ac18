//! Field mapping table: sheet column labels ↔ internal storage keys.
//!
//! Names that appear in neither direction pass through untranslated, so a
//! column added to the sheet reaches the store under its own label and a
//! store-only column reaches the sheet under its key.

use std::collections::HashMap;

use crate::config::ColumnMapping;
use crate::error::CoreError;
use crate::types::FieldMap;

/// Bidirectional label/key translation.
#[derive(Debug, Clone, Default)]
pub struct FieldMapping {
    label_to_key: HashMap<String, String>,
    key_to_label: HashMap<String, String>,
}

impl FieldMapping {
    /// Build the table, rejecting duplicate labels or keys (the mapping must
    /// be a bijection for `to_external` to undo `to_internal`).
    pub fn new(columns: &[ColumnMapping]) -> Result<Self, CoreError> {
        let mut label_to_key = HashMap::with_capacity(columns.len());
        let mut key_to_label = HashMap::with_capacity(columns.len());
        for column in columns {
            if label_to_key
                .insert(column.label.clone(), column.key.clone())
                .is_some()
            {
                return Err(CoreError::InvalidMapping(format!(
                    "label '{}' is mapped more than once",
                    column.label
                )));
            }
            if key_to_label
                .insert(column.key.clone(), column.label.clone())
                .is_some()
            {
                return Err(CoreError::InvalidMapping(format!(
                    "key '{}' is mapped more than once",
                    column.key
                )));
            }
        }
        Ok(Self {
            label_to_key,
            key_to_label,
        })
    }

    pub fn key_for<'a>(&'a self, label: &'a str) -> &'a str {
        self.label_to_key
            .get(label)
            .map(String::as_str)
            .unwrap_or(label)
    }

    pub fn label_for<'a>(&'a self, key: &'a str) -> &'a str {
        self.key_to_label
            .get(key)
            .map(String::as_str)
            .unwrap_or(key)
    }

    /// Translate sheet labels to storage keys.
    pub fn to_internal(&self, fields: &FieldMap) -> FieldMap {
        fields
            .iter()
            .map(|(name, value)| (self.key_for(name).to_string(), value.clone()))
            .collect()
    }

    /// Translate storage keys back to sheet labels.
    pub fn to_external(&self, fields: &FieldMap) -> FieldMap {
        fields
            .iter()
            .map(|(name, value)| (self.label_for(name).to_string(), value.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.label_to_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.label_to_key.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn columns() -> Vec<ColumnMapping> {
        vec![
            ColumnMapping::new("Order Code", "order_code"),
            ColumnMapping::new("Status", "status"),
            ColumnMapping::new("Unit Price", "price"),
        ]
    }

    #[test]
    fn translates_known_labels_and_passes_unknown_through() {
        let mapping = FieldMapping::new(&columns()).unwrap();
        let mut fields = FieldMap::new();
        fields.insert("Unit Price".into(), json!(10));
        fields.insert("Notes".into(), json!("fragile"));

        let internal = mapping.to_internal(&fields);
        assert_eq!(internal.get("price"), Some(&json!(10)));
        assert_eq!(internal.get("Notes"), Some(&json!("fragile")));
        assert!(!internal.contains_key("Unit Price"));
    }

    #[test]
    fn external_translation_undoes_internal() {
        let mapping = FieldMapping::new(&columns()).unwrap();
        let mut fields = FieldMap::new();
        fields.insert("Status".into(), json!("shipped"));
        fields.insert("Order Code".into(), json!("DH001"));

        let back = mapping.to_external(&mapping.to_internal(&fields));
        assert_eq!(back, fields);
    }

    #[test]
    fn duplicate_label_is_rejected() {
        let mut cols = columns();
        cols.push(ColumnMapping::new("Status", "state"));
        let err = FieldMapping::new(&cols).unwrap_err();
        assert!(err.to_string().contains("Status"));
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let mut cols = columns();
        cols.push(ColumnMapping::new("Price", "price"));
        let err = FieldMapping::new(&cols).unwrap_err();
        assert!(matches!(err, CoreError::InvalidMapping(_)));
    }
}
