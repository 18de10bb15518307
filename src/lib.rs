//! ERP Fulfillment Library
//!
//! Order fulfillment pipeline and inventory/batch ledger: delivery notes,
//! invoices, payments and credit notes on top of an append-only stock
//! movement log with a lot quarantine workflow.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

// Core modules
pub mod config;
pub mod context;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod services;

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tokio::sync::mpsc;
use tracing::info;

pub use context::OperationContext;
pub use errors::{ErrorKind, ServiceError};

use crate::config::{AppConfig, LedgerSettings};
use crate::events::{Event, EventSender};
use crate::services::factory::{ServiceContainer, ServiceFactory};

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: AppConfig,
    pub settings: LedgerSettings,
    pub event_sender: EventSender,
    pub services: ServiceContainer,
}

impl AppState {
    /// Connects to the database, applies migrations when configured and
    /// wires every service to one event channel.
    pub async fn bootstrap(
        config: AppConfig,
    ) -> Result<(Self, mpsc::Receiver<Event>), ServiceError> {
        let db = db::establish_connection_from_app_config(&config).await?;
        if config.auto_migrate {
            db::run_migrations(&db).await?;
        }
        Ok(Self::from_connection(Arc::new(db), config))
    }

    /// Wires the services around an existing connection.
    pub fn from_connection(
        db: Arc<DatabaseConnection>,
        config: AppConfig,
    ) -> (Self, mpsc::Receiver<Event>) {
        let settings = LedgerSettings::from(&config);
        let (event_sender, event_rx) = EventSender::channel(config.event_channel_capacity.max(1));
        let factory = ServiceFactory::new(db.clone(), settings.clone(), Some(event_sender.clone()));
        let services = ServiceContainer::new(&factory);

        info!(environment = %config.environment, "Fulfillment services ready");

        (
            Self {
                db,
                config,
                settings,
                event_sender,
                services,
            },
            event_rx,
        )
    }

    /// Context for one operation with the configured deadline.
    pub fn context(&self, actor: impl Into<String>) -> OperationContext {
        OperationContext::new(actor).with_timeout(self.settings.operation_timeout)
    }
}
