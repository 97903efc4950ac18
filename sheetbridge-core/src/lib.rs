//! SheetBridge core library: domain types, field mapping, value
//! normalization, configuration.
//!
//! - [`types`]: newtypes and the records that flow through the engine
//! - [`mapping`]: [`FieldMapping`], document label ↔ storage key
//! - [`normalize`]: [`Normalizer`] for status-like free text
//! - [`config`]: `config.yaml` load / save
//! - [`error`]: [`CoreError`]

pub mod config;
pub mod error;
pub mod mapping;
pub mod normalize;
pub mod types;

pub use config::{ColumnMapping, SyncConfig};
pub use error::CoreError;
pub use mapping::FieldMapping;
pub use normalize::Normalizer;
pub use types::{
    CollectionName, FieldMap, PendingUpdate, Record, RecordKey, Source, VersionedChange,
};
