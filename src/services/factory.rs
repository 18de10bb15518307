use std::sync::Arc;

use crate::{
    config::LedgerSettings,
    db::DbPool,
    events::EventSender,
    services::{
        delivery_notes::DeliveryNoteService, inventory::InventoryService,
        invoicing::InvoiceService, order_status::OrderStatusService,
        order_summary::OrderSummaryService, orders::OrderService, payments::PaymentService,
        quarantine::QuarantineService,
    },
};

/// Factory for creating service instances with shared dependencies
pub struct ServiceFactory {
    db_pool: Arc<DbPool>,
    settings: Arc<LedgerSettings>,
    event_sender: Option<EventSender>,
}

impl ServiceFactory {
    /// Creates a new service factory with the given dependencies
    pub fn new(
        db_pool: Arc<DbPool>,
        settings: LedgerSettings,
        event_sender: Option<EventSender>,
    ) -> Self {
        Self {
            db_pool,
            settings: Arc::new(settings),
            event_sender,
        }
    }

    pub fn inventory_service(&self) -> InventoryService {
        InventoryService::new(
            self.db_pool.clone(),
            self.settings.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn quarantine_service(&self) -> QuarantineService {
        QuarantineService::new(
            self.db_pool.clone(),
            self.settings.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn order_service(&self) -> OrderService {
        OrderService::new(
            self.db_pool.clone(),
            self.settings.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn order_status_service(&self) -> OrderStatusService {
        OrderStatusService::new(
            self.db_pool.clone(),
            self.settings.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn order_summary_service(&self) -> OrderSummaryService {
        OrderSummaryService::new(
            self.db_pool.clone(),
            self.settings.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn delivery_note_service(&self) -> DeliveryNoteService {
        DeliveryNoteService::new(
            self.db_pool.clone(),
            self.settings.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn invoice_service(&self) -> InvoiceService {
        InvoiceService::new(
            self.db_pool.clone(),
            self.settings.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn payment_service(&self) -> PaymentService {
        PaymentService::new(
            self.db_pool.clone(),
            self.settings.clone(),
            self.event_sender.clone(),
        )
    }

    /// Gets a reference to the database pool
    pub fn db_pool(&self) -> &Arc<DbPool> {
        &self.db_pool
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub inventory: Arc<InventoryService>,
    pub quarantine: Arc<QuarantineService>,
    pub orders: Arc<OrderService>,
    pub order_status: Arc<OrderStatusService>,
    pub order_summary: Arc<OrderSummaryService>,
    pub delivery_notes: Arc<DeliveryNoteService>,
    pub invoices: Arc<InvoiceService>,
    pub payments: Arc<PaymentService>,
}

impl ServiceContainer {
    /// Creates a new service container with all services initialized
    pub fn new(factory: &ServiceFactory) -> Self {
        Self {
            inventory: Arc::new(factory.inventory_service()),
            quarantine: Arc::new(factory.quarantine_service()),
            orders: Arc::new(factory.order_service()),
            order_status: Arc::new(factory.order_status_service()),
            order_summary: Arc::new(factory.order_summary_service()),
            delivery_notes: Arc::new(factory.delivery_note_service()),
            invoices: Arc::new(factory.invoice_service()),
            payments: Arc::new(factory.payment_service()),
        }
    }
}
