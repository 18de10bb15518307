use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

use erp_fulfillment::{
    config,
    db,
    entities::invoice::InvoiceMode,
    events,
    services::{
        delivery_notes::{DeliveryLineRequest, DeliveryNoteRequest},
        inventory::{IssueReason, StockIssue, StockReceipt},
    },
    AppState, OperationContext,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(&cfg.log_level, cfg.log_json);

    let pool = db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the database")?;

    if let Commands::Migrate = cli.command {
        db::run_migrations(&pool)
            .await
            .context("failed to run migrations")?;
        println!("Migrations applied");
        return Ok(());
    }

    if cfg.auto_migrate {
        db::run_migrations(&pool)
            .await
            .context("failed to run migrations")?;
    }

    let (state, event_rx) = AppState::from_connection(Arc::new(pool), cfg);
    tokio::spawn(events::process_events(event_rx));

    let mut ctx = state.context(cli.actor.clone());
    if let Some(key) = cli.idempotency_key.clone() {
        ctx = ctx.with_idempotency_key(key);
    }
    debug!(actor = %ctx.actor, "Running command");

    run(&state, &ctx, cli.command, cli.json).await
}

async fn run(state: &AppState, ctx: &OperationContext, command: Commands, json: bool) -> Result<()> {
    let services = &state.services;
    match command {
        Commands::Migrate => Ok(()),
        Commands::StockBalance(args) => {
            let balance = services
                .inventory
                .stock_balance(ctx, args.article, args.location)
                .await
                .context("failed to read stock balance")?;
            let available = services
                .inventory
                .available_balance(ctx, args.article)
                .await
                .context("failed to read available stock")?;
            if json {
                print_json(&serde_json::json!({
                    "article_id": args.article,
                    "location_id": args.location,
                    "on_hand": balance,
                    "available": available,
                }))
            } else {
                match args.location {
                    Some(location) => println!(
                        "Article {} at location {}: {}",
                        args.article, location, balance
                    ),
                    None => println!(
                        "Article {}: {} on hand, {} available",
                        args.article, balance, available
                    ),
                }
                Ok(())
            }
        }
        Commands::Receive(args) => {
            let movement = services
                .inventory
                .record_receipt(
                    ctx,
                    StockReceipt {
                        article_id: args.article,
                        location_id: args.location,
                        quantity: args.quantity,
                        lot_number: args.lot,
                        expiry_date: args.expiry,
                        unit_cost: args.unit_cost,
                        reference_document_id: args.reference,
                    },
                )
                .await
                .context("failed to record receipt")?;
            render(json, &movement, || {
                format!("Received {} (movement {})", movement.quantity, movement.id)
            })
        }
        Commands::Issue(args) => {
            let movement = services
                .inventory
                .record_issue(
                    ctx,
                    StockIssue {
                        article_id: args.article,
                        location_id: args.location,
                        quantity: args.quantity,
                        reason: args.reason.into(),
                        source_lot_id: args.lot,
                        reference_document_id: args.reference,
                    },
                )
                .await
                .context("failed to record issue")?;
            render(json, &movement, || {
                format!("Issued {} (movement {})", movement.quantity, movement.id)
            })
        }
        Commands::Quarantine(args) => {
            let transition = services
                .quarantine
                .quarantine(ctx, args.lot, &args.reason)
                .await
                .context("failed to quarantine lot")?;
            render(json, &transition, || {
                format!(
                    "Lot {} quarantined: {} moved to location {}",
                    args.lot, transition.quantity, transition.event.to_location_id
                )
            })
        }
        Commands::Release(args) => {
            let transition = services
                .quarantine
                .release(ctx, args.lot, args.to)
                .await
                .context("failed to release lot")?;
            render(json, &transition, || {
                format!(
                    "Lot {} released: {} moved to location {}",
                    args.lot, transition.quantity, transition.event.to_location_id
                )
            })
        }
        Commands::DeliveryNote(args) => {
            let lines = if args.lines.is_empty() {
                None
            } else {
                Some(args.lines)
            };
            let note = services
                .delivery_notes
                .create_delivery_note(
                    ctx,
                    DeliveryNoteRequest {
                        order_id: args.order,
                        lines,
                        ship_from_location_id: args.ship_from,
                    },
                )
                .await
                .context("failed to create delivery note")?;
            render(json, &note, || {
                format!(
                    "Delivery note {} with {} line(s), {} skipped",
                    note.header.number,
                    note.lines.len(),
                    note.skipped_line_ids.len()
                )
            })
        }
        Commands::Invoice(args) => {
            let document = services
                .invoices
                .create_invoice(ctx, args.order, args.mode.into())
                .await
                .context("failed to create invoice")?;
            render(json, &document, || {
                format!(
                    "Invoice {} over {} {}",
                    document.header.number, document.header.gross_total, document.header.currency
                )
            })
        }
        Commands::Payment(args) => {
            let paid_on = args.date.unwrap_or_else(|| Utc::now().date_naive());
            let receipt = services
                .payments
                .record_payment(ctx, args.invoice, args.amount, paid_on)
                .await
                .context("failed to record payment")?;
            render(json, &receipt, || {
                format!(
                    "Invoice {} is {} with {} open",
                    receipt.invoice.number, receipt.invoice.status, receipt.balance.open_balance
                )
            })
        }
        Commands::Recalc(args) => {
            let summary = services
                .order_summary
                .recalculate(ctx, args.order)
                .await
                .context("failed to recalculate order summary")?;
            render(json, &summary, || {
                format!(
                    "Order {}: gross {}, {}, {}, {}",
                    args.order,
                    summary.gross_total,
                    summary.delivery_status,
                    summary.invoice_status,
                    summary.payment_status
                )
            })
        }
    }
}

#[derive(Parser)]
#[command(
    name = "fulfillment-cli",
    about = "Operator tool for the fulfillment pipeline and stock ledger",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[arg(long, global = true, default_value = "cli", help = "Actor recorded on every change")]
    actor: String,
    #[arg(long, global = true, help = "Replay key for retried writes")]
    idempotency_key: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,
    /// Show on-hand stock of an article
    StockBalance(StockBalanceArgs),
    /// Record goods arriving at a location
    Receive(ReceiveArgs),
    /// Record goods leaving stock
    Issue(IssueArgs),
    /// Move a lot to the quarantine location
    Quarantine(QuarantineArgs),
    /// Return a quarantined lot
    Release(ReleaseArgs),
    /// Create a delivery note for an order
    DeliveryNote(DeliveryNoteArgs),
    /// Create an invoice for an order
    Invoice(InvoiceArgs),
    /// Record a payment against an invoice
    Payment(PaymentArgs),
    /// Recalculate the summary of an order
    Recalc(RecalcArgs),
}

#[derive(Args)]
struct StockBalanceArgs {
    #[arg(long)]
    article: i64,
    #[arg(long)]
    location: Option<i64>,
}

#[derive(Args)]
struct ReceiveArgs {
    #[arg(long)]
    article: i64,
    #[arg(long)]
    location: i64,
    #[arg(long)]
    quantity: Decimal,
    #[arg(long, help = "Batch number of the lot")]
    lot: Option<String>,
    #[arg(long, help = "Expiry date (YYYY-MM-DD)")]
    expiry: Option<NaiveDate>,
    #[arg(long)]
    unit_cost: Option<Decimal>,
    #[arg(long)]
    reference: Option<i64>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReasonArg {
    Sale,
    StockCount,
    Shrinkage,
    Return,
    Transfer,
    Correction,
}

impl From<ReasonArg> for IssueReason {
    fn from(reason: ReasonArg) -> Self {
        match reason {
            ReasonArg::Sale => IssueReason::Sale,
            ReasonArg::StockCount => IssueReason::StockCount,
            ReasonArg::Shrinkage => IssueReason::Shrinkage,
            ReasonArg::Return => IssueReason::Return,
            ReasonArg::Transfer => IssueReason::Transfer,
            ReasonArg::Correction => IssueReason::Correction,
        }
    }
}

#[derive(Args)]
struct IssueArgs {
    #[arg(long)]
    article: i64,
    #[arg(long)]
    location: Option<i64>,
    #[arg(long)]
    quantity: Decimal,
    #[arg(long, value_enum)]
    reason: ReasonArg,
    #[arg(long, help = "Lot id to issue from")]
    lot: Option<i64>,
    #[arg(long)]
    reference: Option<i64>,
}

#[derive(Args)]
struct QuarantineArgs {
    #[arg(long)]
    lot: i64,
    #[arg(long)]
    reason: String,
}

#[derive(Args)]
struct ReleaseArgs {
    #[arg(long)]
    lot: i64,
    #[arg(long, help = "Target location; defaults to where the lot came from")]
    to: Option<i64>,
}

#[derive(Args)]
struct DeliveryNoteArgs {
    #[arg(long)]
    order: i64,
    #[arg(long, help = "Issue stock from this location")]
    ship_from: Option<i64>,
    #[arg(
        long = "line",
        value_parser = parse_delivery_line,
        help = "ORDER_LINE_ID:QUANTITY[:LOT_ID]; all remaining quantity when omitted"
    )]
    lines: Vec<DeliveryLineRequest>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    FromDelivery,
    Direct,
}

impl From<ModeArg> for InvoiceMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::FromDelivery => InvoiceMode::FromDelivery,
            ModeArg::Direct => InvoiceMode::Direct,
        }
    }
}

#[derive(Args)]
struct InvoiceArgs {
    #[arg(long)]
    order: i64,
    #[arg(long, value_enum, default_value = "from-delivery")]
    mode: ModeArg,
}

#[derive(Args)]
struct PaymentArgs {
    #[arg(long)]
    invoice: i64,
    #[arg(long)]
    amount: Decimal,
    #[arg(long, help = "Payment date (YYYY-MM-DD), today when omitted")]
    date: Option<NaiveDate>,
}

#[derive(Args)]
struct RecalcArgs {
    #[arg(long)]
    order: i64,
}

fn parse_delivery_line(raw: &str) -> Result<DeliveryLineRequest, String> {
    let mut parts = raw.split(':');
    let order_line_id = parts
        .next()
        .and_then(|part| part.trim().parse::<i64>().ok())
        .ok_or_else(|| format!("invalid order line id in '{}'", raw))?;
    let quantity = parts
        .next()
        .and_then(|part| part.trim().parse::<Decimal>().ok())
        .ok_or_else(|| format!("invalid quantity in '{}'", raw))?;
    let lot_id = match parts.next() {
        Some(part) => Some(
            part.trim()
                .parse::<i64>()
                .map_err(|_| format!("invalid lot id in '{}'", raw))?,
        ),
        None => None,
    };
    if parts.next().is_some() {
        return Err(format!("too many fields in '{}'", raw));
    }
    Ok(DeliveryLineRequest {
        order_line_id,
        quantity,
        lot_id,
    })
}

fn render<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    if json {
        print_json(value)
    } else {
        println!("{}", text());
        Ok(())
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).map_err(|e| anyhow!(e))?;
    println!("{}", rendered);
    Ok(())
}
