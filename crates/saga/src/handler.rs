//! Handler capability traits.
//!
//! A handler is declared once through associated types and constants; the
//! registry turns that into a [`HandlerDescriptor`] at registration so
//! dispatch never has to probe a handler's shape.
//!
//! | shape                         | `Data`        | `STARTS_SAGA` |
//! |-------------------------------|---------------|---------------|
//! | reactive step handler         | `()`          | `false`       |
//! | reactive starting handler     | `()`          | `true`        |
//! | coordinated handler           | a [`SagaData`] | `false`      |
//! | coordinated starting handler  | a [`SagaData`] | `true`       |

use async_trait::async_trait;
use serde::{Serialize, de::DeserializeOwned};

use crate::context::SagaContext;
use crate::error::HandlerError;
use crate::message::{MessageKind, SagaMessage};

/// Saga-scoped business state shared by a saga's coordinated handlers.
///
/// Loaded (or defaulted) before the handler runs and saved back after.
pub trait SagaData: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    /// `false` skips loading and saving entirely.
    const PERSISTENT: bool = true;
}

/// No saga data: the handler is reactive.
impl SagaData for () {
    const PERSISTENT: bool = false;
}

/// A participant in a saga.
#[async_trait]
pub trait SagaHandler: Send + Sync + 'static {
    type Message: SagaMessage;
    type Data: SagaData;

    /// Name recorded in step keys and used for routing.
    const HANDLER_TYPE: &'static str;

    /// May receive messages without a saga id; one is generated.
    const STARTS_SAGA: bool = false;

    /// Eligible to compensate steps of its message type.
    const COMPENSATES: bool = true;

    /// Only forwards responses to a coordinator. Steps recorded by relays
    /// are skipped when compensation walks to a parent.
    const RELAYS_RESPONSES: bool = false;

    /// Business entry point for commands and events.
    async fn handle(
        &self,
        ctx: &mut SagaContext<Self::Message, Self::Data>,
        message: Self::Message,
    ) -> Result<(), HandlerError>;

    async fn handle_success_response(
        &self,
        ctx: &mut SagaContext<Self::Message, Self::Data>,
        message: Self::Message,
    ) -> Result<(), HandlerError> {
        self.handle(ctx, message).await
    }

    /// Undoes the step recorded for `message`.
    ///
    /// The context is bound to the step being compensated. Implementations
    /// finish with `mark_as_compensated`, which continues with the parent
    /// step; returning [`HandlerError::Failed`] records
    /// `CompensationFailed` and stops the chain.
    async fn compensate(
        &self,
        ctx: &mut SagaContext<Self::Message, Self::Data>,
        _message: Self::Message,
    ) -> Result<(), HandlerError> {
        ctx.mark_as_compensated::<Self::Message>().await?;
        Ok(())
    }
}

/// Registration-time summary of a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerDescriptor {
    pub handler_type: &'static str,
    pub message_type: &'static str,
    /// `None` for handlers without persistent saga data.
    pub data_type: Option<&'static str>,
    pub starts_saga: bool,
    pub compensates: bool,
    pub relays_responses: bool,
}

impl HandlerDescriptor {
    pub fn of<H: SagaHandler>() -> Self {
        Self {
            handler_type: H::HANDLER_TYPE,
            message_type: H::Message::message_type(),
            data_type: H::Data::PERSISTENT.then(std::any::type_name::<H::Data>),
            starts_saga: H::STARTS_SAGA,
            compensates: H::COMPENSATES,
            relays_responses: H::RELAYS_RESPONSES,
        }
    }
}

/// Handler method a message is routed to, chosen by its [`MessageKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryPoint {
    Handle,
    SuccessResponse,
    /// Failed events mark the current step failed, which hands it to the
    /// handler's `compensate`.
    Compensate,
}

impl EntryPoint {
    pub fn for_kind(kind: MessageKind) -> Self {
        match kind {
            MessageKind::FailedEvent => EntryPoint::Compensate,
            MessageKind::SuccessResponse => EntryPoint::SuccessResponse,
            MessageKind::Command | MessageKind::Event | MessageKind::FailResponse => {
                EntryPoint::Handle
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryPoint::Handle => "handle",
            EntryPoint::SuccessResponse => "handle_success_response",
            EntryPoint::Compensate => "compensate",
        }
    }
}
