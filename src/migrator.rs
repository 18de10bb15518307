use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_master_tables::Migration),
            Box::new(m20240301_000002_create_order_tables::Migration),
            Box::new(m20240301_000003_create_invoice_tables::Migration),
            Box::new(m20240301_000004_create_stock_tables::Migration),
            Box::new(m20240301_000005_create_document_sequences::Migration),
        ]
    }
}

// Migration implementations

mod m20240301_000001_create_master_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_master_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Articles::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Articles::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Articles::Sku).string_len(64).not_null().unique_key())
                        .col(ColumnDef::new(Articles::Name).string().not_null())
                        .col(ColumnDef::new(Articles::UnitPrice).decimal().not_null())
                        .col(ColumnDef::new(Articles::TaxRate).decimal().not_null())
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Customers::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Customers::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Customers::Name).string().not_null())
                        .col(
                            ColumnDef::new(Customers::PaymentTermsDays)
                                .integer()
                                .not_null()
                                .default(14),
                        )
                        .col(
                            ColumnDef::new(Customers::TaxHandling)
                                .string_len(32)
                                .not_null()
                                .default("Standard"),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(WarehouseLocations::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(WarehouseLocations::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(WarehouseLocations::Name).string().not_null())
                        .col(
                            ColumnDef::new(WarehouseLocations::IsQuarantine)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(WarehouseLocations::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Customers::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Articles::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Articles {
        Table,
        Id,
        Sku,
        Name,
        UnitPrice,
        TaxRate,
    }

    #[derive(DeriveIden)]
    pub(super) enum Customers {
        Table,
        Id,
        Name,
        PaymentTermsDays,
        TaxHandling,
    }

    #[derive(DeriveIden)]
    pub(super) enum WarehouseLocations {
        Table,
        Id,
        Name,
        IsQuarantine,
    }
}

mod m20240301_000002_create_order_tables {

    use super::m20240301_000001_create_master_tables::{Articles, Customers};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Orders::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Orders::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Orders::Number).string_len(64).not_null().unique_key())
                        .col(ColumnDef::new(Orders::CustomerId).big_integer().not_null())
                        .col(ColumnDef::new(Orders::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Orders::WorkflowStatus).integer().null())
                        .col(ColumnDef::new(Orders::Cancelled).boolean().not_null().default(false))
                        .col(ColumnDef::new(Orders::CancelReason).string().null())
                        .col(ColumnDef::new(Orders::ShippedAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(Orders::PaidAt).date().null())
                        .col(ColumnDef::new(Orders::NetTotal).decimal().not_null().default(0))
                        .col(ColumnDef::new(Orders::TaxTotal).decimal().not_null().default(0))
                        .col(ColumnDef::new(Orders::GrossTotal).decimal().not_null().default(0))
                        .col(ColumnDef::new(Orders::DeliveryStatus).string_len(32).not_null())
                        .col(ColumnDef::new(Orders::InvoiceStatus).string_len(32).not_null())
                        .col(ColumnDef::new(Orders::PaymentStatus).string_len(32).not_null())
                        .col(
                            ColumnDef::new(Orders::FullyDelivered)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Orders::DeliveryNoteCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(Orders::OpenLineCount).integer().not_null().default(0))
                        .col(ColumnDef::new(Orders::CreatedBy).string().not_null())
                        .col(ColumnDef::new(Orders::CreatedAt).timestamp_with_time_zone().not_null())
                        .col(ColumnDef::new(Orders::UpdatedAt).timestamp_with_time_zone().not_null())
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_orders_customer")
                                .from(Orders::Table, Orders::CustomerId)
                                .to(Customers::Table, Customers::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_orders_customer_id")
                        .table(Orders::Table)
                        .col(Orders::CustomerId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(OrderLines::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(OrderLines::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(OrderLines::OrderId).big_integer().not_null())
                        .col(ColumnDef::new(OrderLines::Position).integer().not_null())
                        .col(ColumnDef::new(OrderLines::ArticleId).big_integer().not_null())
                        .col(ColumnDef::new(OrderLines::Quantity).decimal().not_null())
                        .col(ColumnDef::new(OrderLines::UnitPrice).decimal().not_null())
                        .col(
                            ColumnDef::new(OrderLines::DiscountPercent)
                                .decimal()
                                .not_null()
                                .default(0),
                        )
                        .col(ColumnDef::new(OrderLines::TaxRate).decimal().not_null())
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_lines_order")
                                .from(OrderLines::Table, OrderLines::OrderId)
                                .to(Orders::Table, Orders::Id),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_order_lines_article")
                                .from(OrderLines::Table, OrderLines::ArticleId)
                                .to(Articles::Table, Articles::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_order_lines_order_id")
                        .table(OrderLines::Table)
                        .col(OrderLines::OrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(DeliveryNotes::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(DeliveryNotes::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(DeliveryNotes::OrderId).big_integer().not_null())
                        .col(
                            ColumnDef::new(DeliveryNotes::Number)
                                .string_len(80)
                                .not_null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(DeliveryNotes::Sequence).integer().not_null())
                        .col(
                            ColumnDef::new(DeliveryNotes::ShipFromLocationId)
                                .big_integer()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryNotes::IdempotencyKey)
                                .string_len(128)
                                .null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(DeliveryNotes::CreatedBy).string().not_null())
                        .col(
                            ColumnDef::new(DeliveryNotes::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_delivery_notes_order")
                                .from(DeliveryNotes::Table, DeliveryNotes::OrderId)
                                .to(Orders::Table, Orders::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(DeliveryNoteLines::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(DeliveryNoteLines::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(DeliveryNoteLines::DeliveryNoteId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryNoteLines::OrderLineId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(DeliveryNoteLines::Quantity)
                                .decimal()
                                .not_null(),
                        )
                        .col(ColumnDef::new(DeliveryNoteLines::LotId).big_integer().null())
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_delivery_note_lines_note")
                                .from(DeliveryNoteLines::Table, DeliveryNoteLines::DeliveryNoteId)
                                .to(DeliveryNotes::Table, DeliveryNotes::Id),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_delivery_note_lines_order_line")
                                .from(DeliveryNoteLines::Table, DeliveryNoteLines::OrderLineId)
                                .to(OrderLines::Table, OrderLines::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_delivery_note_lines_order_line_id")
                        .table(DeliveryNoteLines::Table)
                        .col(DeliveryNoteLines::OrderLineId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(DeliveryNoteLines::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(DeliveryNotes::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(OrderLines::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Orders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub(super) enum Orders {
        Table,
        Id,
        Number,
        CustomerId,
        Currency,
        WorkflowStatus,
        Cancelled,
        CancelReason,
        ShippedAt,
        PaidAt,
        NetTotal,
        TaxTotal,
        GrossTotal,
        DeliveryStatus,
        InvoiceStatus,
        PaymentStatus,
        FullyDelivered,
        DeliveryNoteCount,
        OpenLineCount,
        CreatedBy,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum OrderLines {
        Table,
        Id,
        OrderId,
        Position,
        ArticleId,
        Quantity,
        UnitPrice,
        DiscountPercent,
        TaxRate,
    }

    #[derive(DeriveIden)]
    pub(super) enum DeliveryNotes {
        Table,
        Id,
        OrderId,
        Number,
        Sequence,
        ShipFromLocationId,
        IdempotencyKey,
        CreatedBy,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    pub(super) enum DeliveryNoteLines {
        Table,
        Id,
        DeliveryNoteId,
        OrderLineId,
        Quantity,
        LotId,
    }
}

mod m20240301_000003_create_invoice_tables {

    use super::m20240301_000001_create_master_tables::Customers;
    use super::m20240301_000002_create_order_tables::Orders;
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_invoice_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Invoices::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Invoices::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Invoices::Kind).string_len(32).not_null())
                        .col(ColumnDef::new(Invoices::Number).string_len(64).not_null().unique_key())
                        .col(ColumnDef::new(Invoices::OrderId).big_integer().null())
                        .col(ColumnDef::new(Invoices::CustomerId).big_integer().not_null())
                        .col(ColumnDef::new(Invoices::OriginalInvoiceId).big_integer().null())
                        .col(ColumnDef::new(Invoices::Mode).string_len(32).null())
                        .col(ColumnDef::new(Invoices::Status).string_len(32).not_null())
                        .col(ColumnDef::new(Invoices::Currency).string_len(3).not_null())
                        .col(ColumnDef::new(Invoices::CustomerName).string().not_null())
                        .col(ColumnDef::new(Invoices::PaymentTermsDays).integer().not_null())
                        .col(ColumnDef::new(Invoices::TaxHandling).string_len(32).not_null())
                        .col(ColumnDef::new(Invoices::NetTotal).decimal().not_null())
                        .col(ColumnDef::new(Invoices::TaxTotal).decimal().not_null())
                        .col(ColumnDef::new(Invoices::GrossTotal).decimal().not_null())
                        .col(ColumnDef::new(Invoices::Reason).string().null())
                        .col(ColumnDef::new(Invoices::DueOn).date().not_null())
                        .col(ColumnDef::new(Invoices::PaidOn).date().null())
                        .col(ColumnDef::new(Invoices::CancelledAt).timestamp_with_time_zone().null())
                        .col(ColumnDef::new(Invoices::CancelledBy).string().null())
                        .col(ColumnDef::new(Invoices::CancellationNote).string().null())
                        .col(
                            ColumnDef::new(Invoices::IdempotencyKey)
                                .string_len(128)
                                .null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Invoices::CreatedBy).string().not_null())
                        .col(
                            ColumnDef::new(Invoices::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_invoices_order")
                                .from(Invoices::Table, Invoices::OrderId)
                                .to(Orders::Table, Orders::Id),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_invoices_customer")
                                .from(Invoices::Table, Invoices::CustomerId)
                                .to(Customers::Table, Customers::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_invoices_order_id")
                        .table(Invoices::Table)
                        .col(Invoices::OrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(InvoiceLines::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(InvoiceLines::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(InvoiceLines::InvoiceId).big_integer().not_null())
                        .col(ColumnDef::new(InvoiceLines::Position).integer().not_null())
                        .col(ColumnDef::new(InvoiceLines::ArticleId).big_integer().null())
                        .col(ColumnDef::new(InvoiceLines::OrderLineId).big_integer().null())
                        .col(
                            ColumnDef::new(InvoiceLines::DeliveryNoteLineId)
                                .big_integer()
                                .null(),
                        )
                        .col(ColumnDef::new(InvoiceLines::Description).string().null())
                        .col(ColumnDef::new(InvoiceLines::Quantity).decimal().not_null())
                        .col(ColumnDef::new(InvoiceLines::UnitPrice).decimal().not_null())
                        .col(
                            ColumnDef::new(InvoiceLines::DiscountPercent)
                                .decimal()
                                .not_null(),
                        )
                        .col(ColumnDef::new(InvoiceLines::TaxRate).decimal().not_null())
                        .col(ColumnDef::new(InvoiceLines::NetAmount).decimal().not_null())
                        .col(ColumnDef::new(InvoiceLines::TaxAmount).decimal().not_null())
                        .col(
                            ColumnDef::new(InvoiceLines::GrossAmount)
                                .decimal()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_invoice_lines_invoice")
                                .from(InvoiceLines::Table, InvoiceLines::InvoiceId)
                                .to(Invoices::Table, Invoices::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Payments::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Payments::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Payments::InvoiceId).big_integer().not_null())
                        .col(ColumnDef::new(Payments::Amount).decimal().not_null())
                        .col(ColumnDef::new(Payments::PaidOn).date().not_null())
                        .col(
                            ColumnDef::new(Payments::IdempotencyKey)
                                .string_len(128)
                                .null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(Payments::RecordedBy).string().not_null())
                        .col(
                            ColumnDef::new(Payments::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payments_invoice")
                                .from(Payments::Table, Payments::InvoiceId)
                                .to(Invoices::Table, Invoices::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payments_invoice_id")
                        .table(Payments::Table)
                        .col(Payments::InvoiceId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Payments::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(InvoiceLines::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Invoices::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Invoices {
        Table,
        Id,
        Kind,
        Number,
        OrderId,
        CustomerId,
        OriginalInvoiceId,
        Mode,
        Status,
        Currency,
        CustomerName,
        PaymentTermsDays,
        TaxHandling,
        NetTotal,
        TaxTotal,
        GrossTotal,
        Reason,
        DueOn,
        PaidOn,
        CancelledAt,
        CancelledBy,
        CancellationNote,
        IdempotencyKey,
        CreatedBy,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum InvoiceLines {
        Table,
        Id,
        InvoiceId,
        Position,
        ArticleId,
        OrderLineId,
        DeliveryNoteLineId,
        Description,
        Quantity,
        UnitPrice,
        DiscountPercent,
        TaxRate,
        NetAmount,
        TaxAmount,
        GrossAmount,
    }

    #[derive(DeriveIden)]
    enum Payments {
        Table,
        Id,
        InvoiceId,
        Amount,
        PaidOn,
        IdempotencyKey,
        RecordedBy,
        CreatedAt,
    }
}

mod m20240301_000004_create_stock_tables {

    use super::m20240301_000001_create_master_tables::{Articles, WarehouseLocations};
    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_stock_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(StockLots::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockLots::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(StockLots::ArticleId).big_integer().not_null())
                        .col(ColumnDef::new(StockLots::LocationId).big_integer().not_null())
                        .col(ColumnDef::new(StockLots::BatchNumber).string_len(64).not_null())
                        .col(ColumnDef::new(StockLots::ExpiryDate).date().null())
                        .col(ColumnDef::new(StockLots::UnitCost).decimal().null())
                        .col(
                            ColumnDef::new(StockLots::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_lots_article")
                                .from(StockLots::Table, StockLots::ArticleId)
                                .to(Articles::Table, Articles::Id),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_lots_location")
                                .from(StockLots::Table, StockLots::LocationId)
                                .to(WarehouseLocations::Table, WarehouseLocations::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("ux_stock_lots_article_batch")
                        .table(StockLots::Table)
                        .col(StockLots::ArticleId)
                        .col(StockLots::BatchNumber)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(StockMovements::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(StockMovements::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(StockMovements::ArticleId).big_integer().not_null())
                        .col(ColumnDef::new(StockMovements::LotId).big_integer().null())
                        .col(ColumnDef::new(StockMovements::FromLocationId).big_integer().null())
                        .col(ColumnDef::new(StockMovements::ToLocationId).big_integer().null())
                        .col(
                            ColumnDef::new(StockMovements::Quantity)
                                .decimal()
                                .not_null(),
                        )
                        .col(ColumnDef::new(StockMovements::Reason).string_len(32).not_null())
                        .col(
                            ColumnDef::new(StockMovements::ReferenceDocumentId)
                                .big_integer()
                                .null(),
                        )
                        .col(ColumnDef::new(StockMovements::UnitCost).decimal().null())
                        .col(
                            ColumnDef::new(StockMovements::IdempotencyKey)
                                .string_len(128)
                                .null()
                                .unique_key(),
                        )
                        .col(ColumnDef::new(StockMovements::Actor).string().not_null())
                        .col(
                            ColumnDef::new(StockMovements::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_movements_article")
                                .from(StockMovements::Table, StockMovements::ArticleId)
                                .to(Articles::Table, Articles::Id),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_stock_movements_lot")
                                .from(StockMovements::Table, StockMovements::LotId)
                                .to(StockLots::Table, StockLots::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_movements_article_id")
                        .table(StockMovements::Table)
                        .col(StockMovements::ArticleId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_stock_movements_lot_id")
                        .table(StockMovements::Table)
                        .col(StockMovements::LotId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(QuarantineEvents::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(QuarantineEvents::Id)
                                .big_integer()
                                .not_null()
                                .auto_increment()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(QuarantineEvents::LotId).big_integer().not_null())
                        .col(ColumnDef::new(QuarantineEvents::Action).string_len(32).not_null())
                        .col(ColumnDef::new(QuarantineEvents::Reason).string().null())
                        .col(
                            ColumnDef::new(QuarantineEvents::FromLocationId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(QuarantineEvents::ToLocationId)
                                .big_integer()
                                .not_null(),
                        )
                        .col(ColumnDef::new(QuarantineEvents::MovementId).big_integer().null())
                        .col(ColumnDef::new(QuarantineEvents::Actor).string().not_null())
                        .col(
                            ColumnDef::new(QuarantineEvents::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_quarantine_events_lot")
                                .from(QuarantineEvents::Table, QuarantineEvents::LotId)
                                .to(StockLots::Table, StockLots::Id),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_quarantine_events_movement")
                                .from(QuarantineEvents::Table, QuarantineEvents::MovementId)
                                .to(StockMovements::Table, StockMovements::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_quarantine_events_lot_id")
                        .table(QuarantineEvents::Table)
                        .col(QuarantineEvents::LotId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(QuarantineEvents::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(StockMovements::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(StockLots::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum StockLots {
        Table,
        Id,
        ArticleId,
        LocationId,
        BatchNumber,
        ExpiryDate,
        UnitCost,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum StockMovements {
        Table,
        Id,
        ArticleId,
        LotId,
        FromLocationId,
        ToLocationId,
        Quantity,
        Reason,
        ReferenceDocumentId,
        UnitCost,
        IdempotencyKey,
        Actor,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum QuarantineEvents {
        Table,
        Id,
        LotId,
        Action,
        Reason,
        FromLocationId,
        ToLocationId,
        MovementId,
        Actor,
        CreatedAt,
    }
}

mod m20240301_000005_create_document_sequences {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000005_create_document_sequences"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(DocumentSequences::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(DocumentSequences::DocType)
                                .string_len(32)
                                .not_null()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(DocumentSequences::NextValue)
                                .big_integer()
                                .not_null()
                                .default(1),
                        )
                        .to_owned(),
                )
                .await?;

            // One row per numbered document type so numbering only ever updates.
            let mut seed = Query::insert();
            seed.into_table(DocumentSequences::Table)
                .columns([DocumentSequences::DocType, DocumentSequences::NextValue]);
            for doc_type in ["order", "invoice", "credit_note"] {
                seed.values([doc_type.into(), 1i64.into()])
                    .map_err(|e| DbErr::Migration(e.to_string()))?;
            }
            manager.exec_stmt(seed).await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(DocumentSequences::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum DocumentSequences {
        Table,
        DocType,
        NextValue,
    }
}
