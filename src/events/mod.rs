use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Creates a sender together with its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Publishes a domain event after its unit of work committed. Delivery
/// failures are logged and never undo the committed change.
pub(crate) async fn publish(sender: &Option<EventSender>, event: Event) {
    if let Some(sender) = sender {
        let name = event.name();
        if let Err(e) = sender.send(event).await {
            warn!(event = name, error = %e, "Failed to publish domain event");
        }
    }
}

/// Facts emitted after a fulfillment or ledger change has been committed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: i64,
        number: String,
    },
    OrderLineAdded {
        order_id: i64,
        order_line_id: i64,
    },
    OrderCancelled(i64),
    OrderWorkflowAdvanced {
        order_id: i64,
        from: String,
        to: String,
    },
    OrderSummaryRecalculated(i64),

    StockReceived {
        movement_id: i64,
        article_id: i64,
        lot_id: Option<i64>,
        quantity: Decimal,
    },
    StockIssued {
        movement_id: i64,
        article_id: i64,
        lot_id: Option<i64>,
        quantity: Decimal,
        reason: String,
    },
    StockTransferred {
        movement_id: i64,
        article_id: i64,
        from_location_id: i64,
        to_location_id: i64,
        quantity: Decimal,
    },
    LotQuarantined {
        lot_id: i64,
        movement_id: i64,
        quantity: Decimal,
    },
    LotReleased {
        lot_id: i64,
        to_location_id: i64,
        quantity: Decimal,
    },

    DeliveryNoteCreated {
        delivery_note_id: i64,
        order_id: i64,
        number: String,
    },
    InvoiceCreated {
        invoice_id: i64,
        order_id: i64,
        number: String,
        gross_total: Decimal,
    },
    InvoiceCancelled(i64),
    PaymentRecorded {
        payment_id: i64,
        invoice_id: i64,
        amount: Decimal,
    },
    CreditNoteCreated {
        credit_note_id: i64,
        invoice_id: i64,
        amount: Decimal,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderLineAdded { .. } => "order_line_added",
            Event::OrderCancelled(_) => "order_cancelled",
            Event::OrderWorkflowAdvanced { .. } => "order_workflow_advanced",
            Event::OrderSummaryRecalculated(_) => "order_summary_recalculated",
            Event::StockReceived { .. } => "stock_received",
            Event::StockIssued { .. } => "stock_issued",
            Event::StockTransferred { .. } => "stock_transferred",
            Event::LotQuarantined { .. } => "lot_quarantined",
            Event::LotReleased { .. } => "lot_released",
            Event::DeliveryNoteCreated { .. } => "delivery_note_created",
            Event::InvoiceCreated { .. } => "invoice_created",
            Event::InvoiceCancelled(_) => "invoice_cancelled",
            Event::PaymentRecorded { .. } => "payment_recorded",
            Event::CreditNoteCreated { .. } => "credit_note_created",
        }
    }
}

/// Drains the event channel, logging each event. Returns when every sender
/// has been dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        counter!("fulfillment_events.processed", 1, "event" => event.name());
        match serde_json::to_string(&event) {
            Ok(payload) => info!(event = event.name(), %payload, "Domain event"),
            Err(e) => warn!(event = event.name(), error = %e, "Unserializable domain event"),
        }
    }

    info!("Event processing loop stopped");
}
