use campus_payments::catalog::InMemoryCatalog;
use campus_payments::config::EngineConfig;
use campus_payments::errors::EngineError;
use campus_payments::gateway::SimulatedGateway;
use campus_payments::ledger::WalletLedger;
use campus_payments::money::Money;
use campus_payments::payments::PaymentMethod;
use campus_payments::policy::EventSchedule;
use campus_payments::registry::InMemoryRegistry;
use campus_payments::responses::WalletRow;
use campus_payments::settlement::SettlementService;
use campus_payments::sweeper::spawn_sweeper;
use campus_payments::types::{EventKey, EventType, UserId};
use std::error::Error;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(log_filter())
        .init();

    let mut args = std::env::args().skip(1);
    let (Some(events_path), Some(commands_path)) = (args.next(), args.next()) else {
        error!("usage: campus-payments <events.csv> <commands.csv>");
        return Ok(());
    };

    let config = EngineConfig::from_env();
    info!(currency = %config.currency, refund_window_days = config.refund_window_days, "configuration loaded");
    let gateway = Arc::new(SimulatedGateway::new(config.gateway_min_charge));
    let catalog = Arc::new(InMemoryCatalog::new());
    let registry = Arc::new(InMemoryRegistry::new());
    load_events(&events_path, &catalog, &registry).await?;

    let service = Arc::new(SettlementService::new(
        config.clone(),
        Arc::new(WalletLedger::new()),
        gateway.clone(),
        catalog,
        registry,
    ));
    let sweeper = spawn_sweeper(service.clone(), config.sweep_interval());

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(&commands_path)?;
    for (line, entry) in reader.deserialize().enumerate() {
        let command: Command = match entry {
            Ok(command) => command,
            Err(e) => {
                warn!(line = line + 1, error = %e, "skipping malformed command");
                continue;
            }
        };
        if let Err(e) = run_command(&service, &gateway, &command).await {
            if e.is_business_outcome() {
                info!(line = line + 1, op = %command.op, user = command.user, outcome = %e, "command declined");
            } else {
                warn!(line = line + 1, op = %command.op, user = command.user, error = %e, "command failed");
            }
        }
    }
    sweeper.abort();

    let wallets = service.ledger().shutdown().await;
    let mut wtr = csv::Writer::from_writer(std::io::stdout());
    for (user, snapshot) in wallets {
        if snapshot.balance != snapshot.ledger_total {
            error!(user, balance = %snapshot.balance, ledger_total = %snapshot.ledger_total, "wallet balance diverged from ledger");
        }
        wtr.serialize(WalletRow {
            user,
            balance: snapshot.balance,
            transactions: snapshot.transactions,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

/// `RUST_LOG` when set and valid, `info` otherwise.
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[derive(Debug, serde::Deserialize)]
struct EventRow {
    event_type: String,
    event_id: String,
    price: Money,
    starts_at: Option<String>,
    ends_at: Option<String>,
    capacity: Option<u32>,
}

#[derive(Debug, serde::Deserialize)]
struct Command {
    op: String,
    user: UserId,
    event_type: Option<String>,
    event_id: Option<String>,
    method: Option<String>,
    amount: Option<Money>,
}

impl Command {
    fn event(&self) -> Result<EventKey, EngineError> {
        match (&self.event_type, &self.event_id) {
            (Some(event_type), Some(event_id)) if !event_id.is_empty() => {
                let event_type: EventType = event_type.parse().map_err(EngineError::NotFound)?;
                Ok(EventKey::new(event_type, event_id.as_str()))
            }
            _ => Err(EngineError::NotFound(format!("`{}` needs an event", self.op))),
        }
    }
}

async fn load_events(
    path: impl AsRef<Path>,
    catalog: &InMemoryCatalog,
    registry: &InMemoryRegistry,
) -> Result<(), Box<dyn Error>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;
    for entry in reader.deserialize() {
        let row: EventRow = entry?;
        let event = EventKey::new(row.event_type.parse::<EventType>()?, row.event_id);
        catalog
            .insert(
                event.clone(),
                row.price,
                EventSchedule {
                    starts_at: row.starts_at,
                    ends_at: row.ends_at,
                },
            )
            .await;
        registry.set_capacity(event, row.capacity).await;
    }
    Ok(())
}

async fn run_command(
    service: &SettlementService,
    gateway: &SimulatedGateway,
    command: &Command,
) -> Result<(), EngineError> {
    let user = command.user;
    match command.op.as_str() {
        "open" => {
            service.ledger().open_wallet(user).await;
        }
        "topup" => {
            let amount = command
                .amount
                .ok_or_else(|| EngineError::InvalidAmount("topup needs an amount".into()))?;
            let intent = service.begin_top_up(user, amount).await?;
            gateway.approve(&intent.intent_id).await;
            let outcome = service.confirm_payment(user, intent.payment_id).await?;
            info!(user, ?outcome, "topup");
        }
        "register" => {
            let method = match command.method.as_deref() {
                Some(method) if !method.is_empty() => {
                    method.parse().map_err(EngineError::NotFound)?
                }
                _ => PaymentMethod::Wallet,
            };
            let outcome = service
                .register_for_event(user, &command.event()?, method)
                .await?;
            info!(user, ?outcome, "register");
        }
        op @ ("approve" | "decline" | "confirm") => {
            let event = command.event()?;
            let payment = service
                .pending_payment(user, &event)
                .await
                .ok_or_else(|| EngineError::NotFound(format!("pending payment for {}", event)))?;
            if let Some(intent_id) = payment.gateway_intent_id.as_deref() {
                match op {
                    "approve" => {
                        gateway.approve(intent_id).await;
                    }
                    "decline" => {
                        gateway.decline(intent_id).await;
                    }
                    _ => {}
                }
            }
            let outcome = service.confirm_payment(user, payment.id).await?;
            info!(user, ?outcome, "confirm");
        }
        "cancel" => {
            let outcome = service
                .cancel_registration(user, &command.event()?)
                .await?;
            info!(user, refunded = %outcome.refunded, "cancel");
        }
        "balance" => {
            let summary = service.wallet_summary(user).await?;
            info!(user, balance = %summary.balance, recent = summary.recent_transactions.len(), "balance");
        }
        "sweep" => {
            let report = service.sweep_stale_payments().await;
            info!(
                expired = report.expired.len(),
                settled = report.settled.len(),
                reconciled = report.reconciled.len(),
                "sweep"
            );
        }
        other => warn!(op = other, "unknown command"),
    }
    Ok(())
}
