//! Canonical form for status-like free text.
//!
//! Sheet users type "Shipped", " shipped ", or a decomposed "Đã giao"; all of
//! them must compare equal once stored.

use std::collections::HashSet;

use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

use crate::types::FieldMap;

/// Trim, NFC-compose, lower-case, and collapse internal whitespace.
pub fn normalize(value: &str) -> String {
    let composed: String = value.trim().nfc().collect();
    composed
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Applies [`normalize`] to the configured status-like fields.
#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    status_fields: HashSet<String>,
}

impl Normalizer {
    pub fn new<I, S>(status_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            status_fields: status_fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_status_field(&self, name: &str) -> bool {
        self.status_fields.contains(name)
    }

    /// Normalize string values of status-like fields in place. Non-string
    /// values are left alone.
    pub fn normalize_fields(&self, fields: &mut FieldMap) {
        for (name, value) in fields.iter_mut() {
            if !self.is_status_field(name) {
                continue;
            }
            if let Value::String(text) = value {
                *text = normalize(text);
            }
        }
    }
}
