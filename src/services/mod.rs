// Stock ledger
pub mod inventory;
pub mod quarantine;

// Order fulfillment pipeline
pub mod delivery_notes;
pub mod invoicing;
pub mod order_status;
pub mod order_summary;
pub mod orders;
pub mod payments;

// Shared helpers
pub mod numbering;
pub mod pricing;

// Service factory for dependency injection
pub mod factory;
