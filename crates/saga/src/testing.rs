//! Order saga fixtures shared by unit tests.
//!
//! `StartOrder` receives `CreateOrderCommand` and publishes
//! `OrderCreatedEvent`; `Inventory` reacts with `InventoryReserved`;
//! `Payment` either accepts (publishing the `PaymentAccepted` response,
//! forwarded by `ResponseRelay` and audited by `PaymentAudit`) or fails
//! when the order asked it to.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::SagaId;
use serde::{Deserialize, Serialize};

use crate::context::SagaContext;
use crate::error::HandlerError;
use crate::handler::{SagaData, SagaHandler};
use crate::message::{MessageKind, SagaMessage};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderCommand {
    pub order_id: u64,
    pub saga_id: Option<SagaId>,
    pub fail_payment: bool,
}

impl SagaMessage for CreateOrderCommand {
    fn message_type() -> &'static str {
        "CreateOrderCommand"
    }

    fn kind() -> MessageKind {
        MessageKind::Command
    }

    fn saga_id(&self) -> Option<SagaId> {
        self.saga_id
    }

    fn set_saga_id(&mut self, saga_id: SagaId) {
        self.saga_id = Some(saga_id);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedEvent {
    pub order_id: u64,
}

impl SagaMessage for OrderCreatedEvent {
    fn message_type() -> &'static str {
        "OrderCreatedEvent"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryReserved {
    pub order_id: u64,
}

impl SagaMessage for InventoryReserved {
    fn message_type() -> &'static str {
        "InventoryReserved"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveStock {
    pub order_id: u64,
}

impl SagaMessage for ReserveStock {
    fn message_type() -> &'static str {
        "ReserveStock"
    }

    fn kind() -> MessageKind {
        MessageKind::Command
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentAccepted {
    pub order_id: u64,
}

impl SagaMessage for PaymentAccepted {
    fn message_type() -> &'static str {
        "PaymentAccepted"
    }

    fn kind() -> MessageKind {
        MessageKind::SuccessResponse
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unmarked {
    pub note: String,
}

impl SagaMessage for Unmarked {
    fn message_type() -> &'static str {
        "Unmarked"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderSagaData {
    pub order_id: Option<u64>,
    pub fail_payment: bool,
    pub cancelled: bool,
}

impl SagaData for OrderSagaData {}

pub struct StartOrderHandler;

#[async_trait]
impl SagaHandler for StartOrderHandler {
    type Message = CreateOrderCommand;
    type Data = OrderSagaData;

    const HANDLER_TYPE: &'static str = "StartOrder";
    const STARTS_SAGA: bool = true;

    async fn handle(
        &self,
        ctx: &mut SagaContext<CreateOrderCommand, OrderSagaData>,
        message: CreateOrderCommand,
    ) -> Result<(), HandlerError> {
        ctx.data_mut().order_id = Some(message.order_id);
        ctx.data_mut().fail_payment = message.fail_payment;
        ctx.mark_as_complete::<CreateOrderCommand>().await?;

        ctx.publish_with_tracking(OrderCreatedEvent {
            order_id: message.order_id,
        })
        .then_mark_as_complete()
        .await?;
        Ok(())
    }

    async fn compensate(
        &self,
        ctx: &mut SagaContext<CreateOrderCommand, OrderSagaData>,
        _message: CreateOrderCommand,
    ) -> Result<(), HandlerError> {
        ctx.data_mut().cancelled = true;
        ctx.mark_as_compensated::<CreateOrderCommand>().await?;
        Ok(())
    }
}

pub struct InventoryHandler;

#[async_trait]
impl SagaHandler for InventoryHandler {
    type Message = OrderCreatedEvent;
    type Data = ();

    const HANDLER_TYPE: &'static str = "Inventory";

    async fn handle(
        &self,
        ctx: &mut SagaContext<OrderCreatedEvent>,
        message: OrderCreatedEvent,
    ) -> Result<(), HandlerError> {
        ctx.mark_as_complete::<OrderCreatedEvent>().await?;
        ctx.publish_with_tracking(InventoryReserved {
            order_id: message.order_id,
        })
        .then_mark_as_complete()
        .await?;
        Ok(())
    }
}

/// Counts the events it sees.
#[derive(Clone, Default)]
pub struct BillingListener {
    seen: Arc<AtomicUsize>,
}

impl BillingListener {
    pub fn seen(&self) -> usize {
        self.seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SagaHandler for BillingListener {
    type Message = OrderCreatedEvent;
    type Data = ();

    const HANDLER_TYPE: &'static str = "Billing";

    async fn handle(
        &self,
        ctx: &mut SagaContext<OrderCreatedEvent>,
        _message: OrderCreatedEvent,
    ) -> Result<(), HandlerError> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        ctx.mark_as_complete::<OrderCreatedEvent>().await?;
        Ok(())
    }
}

/// Charges the order unless the saga data says the card is declined.
#[derive(Clone, Default)]
pub struct PaymentHandler {
    charged: Arc<Mutex<Vec<u64>>>,
    refunded: Arc<Mutex<Vec<u64>>>,
}

impl PaymentHandler {
    pub fn charged(&self) -> Vec<u64> {
        self.charged.lock().unwrap().clone()
    }

    pub fn refunded(&self) -> Vec<u64> {
        self.refunded.lock().unwrap().clone()
    }
}

#[async_trait]
impl SagaHandler for PaymentHandler {
    type Message = InventoryReserved;
    type Data = OrderSagaData;

    const HANDLER_TYPE: &'static str = "Payment";

    async fn handle(
        &self,
        ctx: &mut SagaContext<InventoryReserved, OrderSagaData>,
        message: InventoryReserved,
    ) -> Result<(), HandlerError> {
        if ctx.data().fail_payment {
            return Err(HandlerError::failed("card declined"));
        }

        self.charged.lock().unwrap().push(message.order_id);
        ctx.mark_as_complete::<InventoryReserved>().await?;
        ctx.publish_with_tracking(PaymentAccepted {
            order_id: message.order_id,
        })
        .then_mark_as_complete()
        .await?;
        Ok(())
    }

    async fn compensate(
        &self,
        ctx: &mut SagaContext<InventoryReserved, OrderSagaData>,
        message: InventoryReserved,
    ) -> Result<(), HandlerError> {
        self.refunded.lock().unwrap().push(message.order_id);
        ctx.mark_as_compensated::<InventoryReserved>().await?;
        Ok(())
    }
}

pub struct ResponseRelay;

#[async_trait]
impl SagaHandler for ResponseRelay {
    type Message = PaymentAccepted;
    type Data = ();

    const HANDLER_TYPE: &'static str = "ResponseRelay";
    const RELAYS_RESPONSES: bool = true;

    async fn handle(
        &self,
        ctx: &mut SagaContext<PaymentAccepted>,
        _message: PaymentAccepted,
    ) -> Result<(), HandlerError> {
        ctx.mark_as_complete::<PaymentAccepted>().await?;
        Ok(())
    }
}

/// Remembers which entry point each `PaymentAccepted` arrived through.
#[derive(Clone, Default)]
pub struct PaymentAuditor {
    entries: Arc<Mutex<Vec<&'static str>>>,
}

impl PaymentAuditor {
    pub fn entries(&self) -> Vec<&'static str> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SagaHandler for PaymentAuditor {
    type Message = PaymentAccepted;
    type Data = ();

    const HANDLER_TYPE: &'static str = "PaymentAudit";

    async fn handle(
        &self,
        ctx: &mut SagaContext<PaymentAccepted>,
        _message: PaymentAccepted,
    ) -> Result<(), HandlerError> {
        self.entries.lock().unwrap().push("handle");
        ctx.mark_as_complete::<PaymentAccepted>().await?;
        Ok(())
    }

    async fn handle_success_response(
        &self,
        ctx: &mut SagaContext<PaymentAccepted>,
        _message: PaymentAccepted,
    ) -> Result<(), HandlerError> {
        self.entries.lock().unwrap().push("handle_success_response");
        ctx.mark_as_complete::<PaymentAccepted>().await?;
        Ok(())
    }
}

/// Returns without recording anything.
pub struct SilentHandler;

#[async_trait]
impl SagaHandler for SilentHandler {
    type Message = Unmarked;
    type Data = ();

    const HANDLER_TYPE: &'static str = "Silent";

    async fn handle(
        &self,
        _ctx: &mut SagaContext<Unmarked>,
        _message: Unmarked,
    ) -> Result<(), HandlerError> {
        Ok(())
    }
}
