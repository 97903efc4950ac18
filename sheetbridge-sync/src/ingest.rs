//! Inbound writes: sheet change notifications and client writes.
//!
//! Both validate synchronously and hand the caller an immediate verdict.
//! Store and sheet outcomes only show up later, through status and polling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sheetbridge_core::normalize::normalize;
use sheetbridge_core::{CollectionName, FieldMap, RecordKey, Source};

use crate::engine::SyncEngine;
use crate::error::ValidationError;
use crate::queue::{EnqueueOutcome, WriteRequest};
use crate::store::is_valid_column;

/// A change observed in the sheet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub collection: CollectionName,
    #[serde(default)]
    pub key: Option<String>,
    /// Changed labels and their new values.
    #[serde(default)]
    pub fields: FieldMap,
    /// Full row, sent instead of `fields` for newly created rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row: Option<FieldMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// A partial update from a web client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientWrite {
    /// Falls back to the configured default collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<CollectionName>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub fields: FieldMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestOutcome {
    #[serde(flatten)]
    pub verdict: EnqueueOutcome,
    /// Version assigned when the change was recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Subscribers that received the change event.
    pub delivered: usize,
}

fn validate(
    collection: &CollectionName,
    key: Option<&str>,
    fields: &FieldMap,
) -> Result<RecordKey, ValidationError> {
    if !collection.is_plain() {
        return Err(ValidationError::InvalidCollection {
            collection: collection.to_string(),
        });
    }
    let key = key.map(str::trim).filter(|k| !k.is_empty());
    let Some(key) = key else {
        return Err(ValidationError::MissingKey);
    };
    if fields.is_empty() {
        return Err(ValidationError::EmptyFields {
            key: key.to_string(),
        });
    }
    Ok(RecordKey::from(key))
}

impl SyncEngine {
    pub fn ingest(&self, notification: ChangeNotification) -> Result<IngestOutcome, ValidationError> {
        self.ingest_at(notification, Utc::now())
    }

    /// Route a sheet change to the queue as an external write. A change
    /// that is queued is also recorded and broadcast right away; an echo
    /// swallowed by a suppression lock or a losing conflict is not.
    pub fn ingest_at(
        &self,
        notification: ChangeNotification,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, ValidationError> {
        let ChangeNotification {
            collection,
            key,
            fields,
            row,
            timestamp,
        } = notification;
        let mut fields = match row {
            Some(row) if fields.is_empty() => row,
            _ => fields,
        };
        let key = validate(&collection, key.as_deref(), &fields)?;

        for (label, value) in fields.iter_mut() {
            if !self.normalizer.is_status_field(self.mapping.key_for(label)) {
                continue;
            }
            if let Some(text) = value.as_str() {
                *value = normalize(text).into();
            }
        }

        let timestamp = timestamp.unwrap_or(now);
        let verdict = self.queue.enqueue_at(
            WriteRequest {
                collection: collection.clone(),
                key: key.clone(),
                fields: fields.clone(),
                source: Source::External,
                timestamp: Some(timestamp),
            },
            now,
        );
        if !verdict.queued {
            return Ok(IngestOutcome {
                verdict,
                version: None,
                delivered: 0,
            });
        }

        // Only what the store will accept is announced.
        let internal: FieldMap = self
            .mapping
            .to_internal(&fields)
            .into_iter()
            .filter(|(name, _)| is_valid_column(name))
            .collect();
        if internal.is_empty() {
            return Ok(IngestOutcome {
                verdict,
                version: None,
                delivered: 0,
            });
        }
        let (version, delivered) =
            self.record_and_broadcast(&collection, &key, &internal, true, now);
        Ok(IngestOutcome {
            verdict,
            version: Some(version),
            delivered,
        })
    }

    pub fn client_write(&self, write: ClientWrite) -> Result<EnqueueOutcome, ValidationError> {
        self.client_write_at(write, Utc::now())
    }

    /// Route a client write to the queue as a trusted internal write
    /// stamped `now`.
    pub fn client_write_at(
        &self,
        write: ClientWrite,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, ValidationError> {
        let collection = write
            .collection
            .unwrap_or_else(|| self.config.default_collection.clone());
        let key = validate(&collection, write.key.as_deref(), &write.fields)?;
        Ok(self.queue.enqueue_at(
            WriteRequest {
                collection,
                key,
                fields: write.fields,
                source: Source::Internal,
                timestamp: Some(now),
            },
            now,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::TimeZone;
    use serde_json::json;
    use sheetbridge_core::SyncConfig;

    use crate::sheet::MemorySheet;
    use crate::store::MemoryStore;

    fn t(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    fn engine() -> SyncEngine {
        SyncEngine::new(
            SyncConfig::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(MemorySheet::new()),
        )
        .unwrap()
    }

    fn labels(pairs: &[(&str, serde_json::Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn missing_or_blank_key_is_rejected() {
        let engine = engine();
        for key in [None, Some("   ".to_string())] {
            let err = engine
                .ingest(ChangeNotification {
                    collection: "orders".into(),
                    key,
                    fields: labels(&[("Status", json!("x"))]),
                    ..Default::default()
                })
                .unwrap_err();
            assert_eq!(err, ValidationError::MissingKey);
        }
        assert_eq!(engine.queue().depth(), 0);
    }

    #[test]
    fn empty_fields_are_rejected() {
        let engine = engine();
        let err = engine
            .client_write(ClientWrite {
                key: Some("DH001".into()),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::EmptyFields {
                key: "DH001".into()
            }
        );
    }

    #[test]
    fn ingest_translates_normalizes_and_records() {
        let engine = engine();
        let outcome = engine
            .ingest_at(
                ChangeNotification {
                    collection: "orders".into(),
                    key: Some(" DH001 ".into()),
                    fields: labels(&[("Status", json!("  In   Transit ")), ("Customer", json!("Ana"))]),
                    timestamp: Some(t(50)),
                    ..Default::default()
                },
                t(60),
            )
            .unwrap();
        assert!(outcome.verdict.queued);
        assert_eq!(outcome.version, Some(1_700_000_000_060));

        let pending = engine.queue().pending(&"orders".into(), &"DH001".into()).unwrap();
        assert_eq!(pending.source, Source::External);
        assert_eq!(pending.timestamp, t(50));
        assert_eq!(pending.fields["status"], json!("in transit"));
        assert_eq!(pending.fields["customer_name"], json!("Ana"));

        let changes = engine.versions().changes_since(&"orders".into(), 0);
        assert_eq!(changes.len(), 1);
        assert!(changes[0].external);
        assert_eq!(changes[0].fields["status"], json!("in transit"));
    }

    #[test]
    fn full_row_is_used_when_fields_are_empty() {
        let engine = engine();
        let outcome = engine
            .ingest(ChangeNotification {
                collection: "orders".into(),
                key: Some("DH009".into()),
                row: Some(labels(&[("Order Code", json!("DH009")), ("Quantity", json!(3))])),
                ..Default::default()
            })
            .unwrap();
        assert!(outcome.verdict.queued);
        let pending = engine.queue().pending(&"orders".into(), &"DH009".into()).unwrap();
        assert_eq!(pending.fields["quantity"], json!(3));
    }

    #[test]
    fn suppressed_ingest_is_not_recorded() {
        let engine = engine();
        engine.locks().arm_at(&"orders".into(), &"DH001".into(), t(100));
        let outcome = engine
            .ingest_at(
                ChangeNotification {
                    collection: "orders".into(),
                    key: Some("DH001".into()),
                    fields: labels(&[("Status", json!("a"))]),
                    timestamp: Some(t(105)),
                    ..Default::default()
                },
                t(105),
            )
            .unwrap();
        assert_eq!(outcome.verdict, EnqueueOutcome::suppressed());
        assert_eq!(outcome.version, None);
        assert!(engine.versions().changes_since(&"orders".into(), 0).is_empty());
    }

    #[test]
    fn client_write_defaults_collection_and_is_internal() {
        let engine = engine();
        let outcome = engine
            .client_write_at(
                ClientWrite {
                    collection: None,
                    key: Some("DH002".into()),
                    fields: labels(&[("price", json!(10))]),
                },
                t(200),
            )
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::queued());

        let pending = engine.queue().pending(&"orders".into(), &"DH002".into()).unwrap();
        assert_eq!(pending.collection.as_str(), "orders");
        assert_eq!(pending.source, Source::Internal);
        assert_eq!(pending.timestamp, t(200));
    }

    #[test]
    fn collection_must_be_a_plain_name() {
        let engine = engine();
        for name in ["../escaped", "a/b", "", ".hidden"] {
            let err = engine
                .client_write(ClientWrite {
                    collection: Some(name.into()),
                    key: Some("DH001".into()),
                    fields: labels(&[("status", json!("x"))]),
                })
                .unwrap_err();
            assert_eq!(
                err,
                ValidationError::InvalidCollection {
                    collection: name.to_string()
                }
            );

            let err = engine
                .ingest(ChangeNotification {
                    collection: name.into(),
                    key: Some("DH001".into()),
                    fields: labels(&[("Status", json!("x"))]),
                    ..Default::default()
                })
                .unwrap_err();
            assert!(matches!(err, ValidationError::InvalidCollection { .. }));
        }
        assert_eq!(engine.queue().depth(), 0);
    }

    #[test]
    fn unmapped_labels_are_not_announced() {
        let engine = engine();
        let outcome = engine
            .ingest(ChangeNotification {
                collection: "orders".into(),
                key: Some("DH010".into()),
                fields: labels(&[("Status", json!("Open")), ("Notes", json!("call back"))]),
                ..Default::default()
            })
            .unwrap();
        assert!(outcome.verdict.queued);

        let changes = engine.versions().changes_since(&"orders".into(), 0);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].fields.len(), 1);
        assert_eq!(changes[0].fields["status"], json!("open"));
    }

    #[test]
    fn change_with_no_storable_columns_is_queued_but_not_recorded() {
        let engine = engine();
        let outcome = engine
            .ingest(ChangeNotification {
                collection: "orders".into(),
                key: Some("DH011".into()),
                fields: labels(&[("Notes", json!("call back"))]),
                ..Default::default()
            })
            .unwrap();
        assert!(outcome.verdict.queued);
        assert_eq!(outcome.version, None);
        assert!(engine.versions().changes_since(&"orders".into(), 0).is_empty());
    }

    #[test]
    fn notification_deserializes_with_missing_optionals() {
        let parsed: ChangeNotification = serde_json::from_value(json!({
            "collection": "orders",
            "key": "DH001",
            "fields": {"Status": "Done"}
        }))
        .unwrap();
        assert_eq!(parsed.key.as_deref(), Some("DH001"));
        assert!(parsed.row.is_none());
        assert!(parsed.timestamp.is_none());
    }
}
