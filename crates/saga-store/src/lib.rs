//! Persistence for saga steps and saga-scoped data.
//!
//! Every write of step metadata goes through the pure [`validator`] first,
//! so transition legality, idempotent redelivery and circular ancestry are
//! decided identically by every backend. Backends differ only in how they
//! make the "replace old record with new record" write atomic:
//!
//! - [`InMemorySagaStore`] validates and writes under one lock.
//! - [`KvSagaStore`] runs a compare-and-swap loop against any
//!   [`KeyValueBackend`] (in-memory or PostgreSQL).

pub mod config;
pub mod error;
pub mod kv;
pub mod memory;
pub mod postgres;
pub mod status;
pub mod step;
pub mod store;
pub mod validator;

pub use common::{MessageId, SagaId};
pub use config::StoreConfig;
pub use error::{Result, SagaStoreError};
pub use kv::{InMemoryKeyValueBackend, KeyValueBackend, KvSagaStore};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresKeyValueBackend;
pub use status::StepStatus;
pub use step::{FailureInfo, SagaStepMetadata, StepKey};
pub use store::{LogStep, SagaStore, SagaStoreExt, StepLookup, StepWrite, StoredMessage};
pub use validator::{StepValidation, ValidationResult};
