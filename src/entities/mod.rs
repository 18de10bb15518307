//! Relational entities for the fulfillment core.
//!
//! Every table is keyed by an `i64` surrogate id. `article`, `customer` and
//! `warehouse_location` are master data owned by other parts of the ERP and
//! are only ever read here.

pub mod article;
pub mod customer;
pub mod delivery_note;
pub mod delivery_note_line;
pub mod document_sequence;
pub mod invoice;
pub mod invoice_line;
pub mod order;
pub mod order_line;
pub mod payment;
pub mod quarantine_event;
pub mod stock_lot;
pub mod stock_movement;
pub mod warehouse_location;
