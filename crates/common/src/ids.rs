//! Id generation seam.

use crate::{MessageId, SagaId};

/// Source of fresh saga and message ids.
///
/// The engine never calls `Uuid::new_v4` directly so tests can supply
/// deterministic ids.
pub trait IdGenerator: Send + Sync {
    fn saga_id(&self) -> SagaId;

    fn message_id(&self) -> MessageId;
}

/// Random (v4) UUID generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn saga_id(&self) -> SagaId {
        SagaId::new()
    }

    fn message_id(&self) -> MessageId {
        MessageId::new()
    }
}
