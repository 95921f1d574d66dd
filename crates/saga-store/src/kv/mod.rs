//! Key/value persistence with compare-and-swap step writes.
//!
//! Layout per saga:
//! - `saga:<sagaId>:steps` — a hash, one field per [`StepKey`](crate::StepKey)
//!   (`step:<stepType>:handler:<handlerType>:message-id:<messageId>`)
//!   holding the JSON-encoded step record.
//! - `saga:<sagaId>:data` — the JSON-encoded saga data document.

mod backend;
mod memory;
mod store;

pub use backend::KeyValueBackend;
pub use memory::InMemoryKeyValueBackend;
pub use store::KvSagaStore;

use crate::SagaId;

/// Hash key holding a saga's step log.
pub fn steps_key(saga_id: SagaId) -> String {
    format!("saga:{saga_id}:steps")
}

/// Key holding a saga's data document.
pub fn data_key(saga_id: SagaId) -> String {
    format!("saga:{saga_id}:data")
}
