#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ActiveValue::Set, DatabaseConnection, EntityTrait};
use tokio::sync::mpsc;

use erp_fulfillment::{
    config::AppConfig,
    db,
    entities::{
        article,
        customer::{self, TaxHandling},
        order, order_line,
        stock_lot::{self, Entity as StockLotEntity},
        warehouse_location,
    },
    events::{self, Event},
    services::{
        factory::ServiceContainer,
        inventory::StockReceipt,
        orders::{NewOrder, NewOrderLine},
    },
    AppState, OperationContext,
};

/// In-memory SQLite ledger with seeded master data.
pub struct TestContext {
    pub state: AppState,
    pub db: Arc<DatabaseConnection>,
    /// Home location, also the configured default location.
    pub main: i64,
    pub shelf: i64,
    pub quarantine: i64,
    pub article: article::Model,
    pub customer: customer::Model,
}

impl TestContext {
    /// Fresh database; events are drained in the background.
    pub async fn new() -> Self {
        let (ctx, rx) = Self::with_events().await;
        tokio::spawn(events::process_events(rx));
        ctx
    }

    /// Fresh database handing the event receiver to the test.
    pub async fn with_events() -> (Self, mpsc::Receiver<Event>) {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(
        adjust: impl FnOnce(&mut AppConfig),
    ) -> (Self, mpsc::Receiver<Event>) {
        let mut cfg = AppConfig::with_database_url("sqlite::memory:");
        cfg.db_max_connections = 1;
        cfg.db_min_connections = 1;
        cfg.retry.backoff_ms = 1;
        adjust(&mut cfg);

        let pool = db::establish_connection_from_app_config(&cfg)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let main = seed_location(&db, "Main warehouse", false).await;
        let shelf = seed_location(&db, "Shelf B", false).await;
        let quarantine = seed_location(&db, "Quarantine", true).await;
        let article = seed_article(&db, "PZN-0001", Decimal::new(8, 0), Decimal::new(25, 0)).await;
        let customer = seed_customer(&db, "Apotheke am Markt", 14, TaxHandling::Standard).await;

        let (state, rx) = AppState::from_connection(db.clone(), cfg);
        (
            Self {
                state,
                db,
                main,
                shelf,
                quarantine,
                article,
                customer,
            },
            rx,
        )
    }

    pub fn services(&self) -> &ServiceContainer {
        &self.state.services
    }

    pub fn ctx(&self) -> OperationContext {
        OperationContext::new("tester").with_timeout(Duration::from_secs(10))
    }

    pub fn keyed(&self, key: &str) -> OperationContext {
        self.ctx().with_idempotency_key(key)
    }

    /// Order for the seeded customer with one line per `(quantity, price)`.
    pub async fn order_with_lines(&self, lines: &[(i64, i64)]) -> (order::Model, Vec<order_line::Model>) {
        let ctx = self.ctx();
        let order = self
            .services()
            .orders
            .create_order(
                &ctx,
                NewOrder {
                    customer_id: self.customer.id,
                    currency: "EUR".into(),
                    number: None,
                },
            )
            .await
            .expect("create order");

        let mut created = Vec::new();
        for (quantity, price) in lines {
            let line = self
                .services()
                .orders
                .add_line(
                    &ctx,
                    NewOrderLine {
                        order_id: order.id,
                        article_id: self.article.id,
                        quantity: Decimal::from(*quantity),
                        unit_price: Some(Decimal::from(*price)),
                        discount_percent: None,
                        tax_rate: None,
                    },
                )
                .await
                .expect("add order line");
            created.push(line);
        }
        (order, created)
    }

    /// Receives `quantity` into lot `batch` at `location` and returns the lot.
    pub async fn receive_lot(&self, location: i64, batch: &str, quantity: i64) -> stock_lot::Model {
        let movement = self
            .services()
            .inventory
            .record_receipt(
                &self.ctx(),
                StockReceipt {
                    article_id: self.article.id,
                    location_id: location,
                    quantity: Decimal::from(quantity),
                    lot_number: Some(batch.to_string()),
                    expiry_date: None,
                    unit_cost: Some(Decimal::new(4, 0)),
                    reference_document_id: None,
                },
            )
            .await
            .expect("receive lot");
        let lot_id = movement.lot_id.expect("receipt into a lot");
        self.lot(lot_id).await
    }

    pub async fn lot(&self, lot_id: i64) -> stock_lot::Model {
        StockLotEntity::find_by_id(lot_id)
            .one(&*self.db)
            .await
            .expect("load lot")
            .expect("lot exists")
    }

    pub async fn order(&self, order_id: i64) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .expect("load order")
            .expect("order exists")
    }
}

pub async fn seed_location(db: &DatabaseConnection, name: &str, is_quarantine: bool) -> i64 {
    warehouse_location::ActiveModel {
        name: Set(name.to_string()),
        is_quarantine: Set(is_quarantine),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("seed location")
    .id
}

pub async fn seed_article(
    db: &DatabaseConnection,
    sku: &str,
    unit_price: Decimal,
    tax_rate: Decimal,
) -> article::Model {
    article::ActiveModel {
        sku: Set(sku.to_string()),
        name: Set(format!("Article {}", sku)),
        unit_price: Set(unit_price),
        tax_rate: Set(tax_rate),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("seed article")
}

pub async fn seed_customer(
    db: &DatabaseConnection,
    name: &str,
    payment_terms_days: i32,
    tax_handling: TaxHandling,
) -> customer::Model {
    customer::ActiveModel {
        name: Set(name.to_string()),
        payment_terms_days: Set(payment_terms_days),
        tax_handling: Set(tax_handling),
        ..Default::default()
    }
    .insert(db)
    .await
    .expect("seed customer")
}
