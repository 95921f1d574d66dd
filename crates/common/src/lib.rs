//! Shared identifier types used by the saga store and the saga engine.

pub mod ids;
pub mod types;

pub use ids::{IdGenerator, UuidGenerator};
pub use types::{MessageId, SagaId};
