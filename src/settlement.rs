use crate::catalog::EventCatalog;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::errors::{EngineError, Result};
use crate::gateway::{Intent, IntentMetadata, IntentStatus, PaymentGateway};
use crate::ledger::WalletLedger;
use crate::money::Money;
use crate::payments::{
    Payment, PaymentMethod, PaymentPurpose, PaymentStatus, PaymentStore, Transition,
};
use crate::policy::{self, RefundDecision};
use crate::registry::{Registration, RegistrationStore};
use crate::responses::{
    CancelOutcome, ConfirmOutcome, RegisterOutcome, TopUpIntent, WalletSummary, SCHEMA_VERSION,
};
use crate::transactions::{NewTransaction, TransactionType};
use crate::types::{EventKey, PaymentId, UserId};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What one sweep did with the stale pending payments it found.
#[derive(Debug, Default, PartialEq)]
pub struct SweepReport {
    pub expired: Vec<PaymentId>,
    /// Gateway reported success after all; settled instead of expired.
    pub settled: Vec<PaymentId>,
    /// Refunded payments whose left-over registration was finally removed.
    pub reconciled: Vec<PaymentId>,
}

/// Drives a registration attempt from pricing to a settled registration, and
/// a cancellation to a refund or a denial.
///
/// Gateway checkouts are two-phase: `register_for_event` leaves a pending
/// payment behind and returns, `confirm_payment` picks it up later. No lock
/// is held in between; the pending payment row is the only state.
pub struct SettlementService {
    config: EngineConfig,
    ledger: Arc<WalletLedger>,
    payments: PaymentStore,
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<dyn EventCatalog>,
    registry: Arc<dyn RegistrationStore>,
    clock: Arc<dyn Clock>,
}

impl SettlementService {
    pub fn new(
        config: EngineConfig,
        ledger: Arc<WalletLedger>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<dyn EventCatalog>,
        registry: Arc<dyn RegistrationStore>,
    ) -> Self {
        SettlementService {
            config,
            ledger,
            payments: PaymentStore::new(),
            gateway,
            catalog,
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn ledger(&self) -> &Arc<WalletLedger> {
        &self.ledger
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn payment(&self, id: PaymentId) -> Result<Payment> {
        self.payments.get(id).await
    }

    /// The open gateway checkout for this user and event, if any.
    pub async fn pending_payment(&self, user: UserId, event: &EventKey) -> Option<Payment> {
        self.payments
            .find_pending(user, event)
            .await
            .filter(|p| p.method == PaymentMethod::Gateway)
    }

    pub async fn wallet_summary(&self, user: UserId) -> Result<WalletSummary> {
        let wallet_id = self.ledger.wallet_id(user).await?;
        let balance = self.ledger.get_balance(user).await?;
        let recent_transactions = self
            .ledger
            .history(user, Some(self.config.recent_transactions))
            .await?;
        Ok(WalletSummary {
            schema_version: SCHEMA_VERSION,
            user_id: user,
            wallet_id,
            balance,
            recent_transactions,
        })
    }

    pub async fn register_for_event(
        &self,
        user: UserId,
        event: &EventKey,
        method: PaymentMethod,
    ) -> Result<RegisterOutcome> {
        if self.registry.find_registration(user, event).await?.is_some() {
            return Err(EngineError::AlreadyRegistered {
                user,
                event: event.clone(),
            });
        }
        let price = self.catalog.event_price(event).await?;
        if price.is_zero() {
            let registration = self.create_registration(user, event, None).await?;
            info!(user, %event, "registered for free event");
            return Ok(RegisterOutcome::Registered { registration });
        }
        match method {
            PaymentMethod::Wallet => self.pay_from_wallet(user, event, price).await,
            PaymentMethod::Gateway => self.open_gateway_checkout(user, event, price).await,
        }
    }

    async fn pay_from_wallet(
        &self,
        user: UserId,
        event: &EventKey,
        price: Money,
    ) -> Result<RegisterOutcome> {
        let now = self.clock.now();
        let payment = Payment::pending(
            user,
            PaymentPurpose::Registration(event.clone()),
            price,
            PaymentMethod::Wallet,
            now,
        );
        let payment_id = payment.id;
        self.payments.insert(payment).await;

        let debit = NewTransaction::new(
            TransactionType::Payment,
            -price,
            format!("registration for {}", event),
            now,
        )
        .for_event(event.clone())
        .for_payment(payment_id);
        if let Err(e) = self.ledger.append_transaction(user, debit).await {
            self.payments
                .transition(payment_id, PaymentStatus::Failed, now)
                .await?;
            info!(user, %event, payment = %payment_id, error = %e, "wallet payment failed");
            return Err(e);
        }

        match self.settle_registration(payment_id).await? {
            ConfirmOutcome::Registered { registration } => {
                Ok(RegisterOutcome::Registered { registration })
            }
            other => Err(EngineError::DataIntegrity(format!(
                "wallet payment {} settled as {:?}",
                payment_id, other
            ))),
        }
    }

    async fn open_gateway_checkout(
        &self,
        user: UserId,
        event: &EventKey,
        price: Money,
    ) -> Result<RegisterOutcome> {
        let (payment, opened) = self
            .payments
            .find_or_insert_pending(Payment::pending(
                user,
                PaymentPurpose::Registration(event.clone()),
                price,
                PaymentMethod::Gateway,
                self.clock.now(),
            ))
            .await;
        let payment_id = payment.id;
        if let (Some(intent_id), Some(client_secret)) =
            (payment.gateway_intent_id.clone(), payment.client_secret.clone())
        {
            debug!(user, %event, payment = %payment_id, "resuming open checkout");
            return Ok(RegisterOutcome::AwaitingConfirmation {
                payment_id,
                intent_id,
                client_secret,
            });
        }
        let description = format!("registration for {}", event);
        let intent = if opened {
            self.create_intent(&payment, description).await?
        } else {
            // The opener is still talking to the gateway. The intent is keyed
            // on the payment id, so asking again yields the same one.
            self.request_intent(&payment, description).await?
        };
        info!(user, %event, payment = %payment_id, intent = %intent.id, "checkout opened");
        Ok(RegisterOutcome::AwaitingConfirmation {
            payment_id,
            intent_id: intent.id,
            client_secret: intent.client_secret,
        })
    }

    pub async fn begin_top_up(&self, user: UserId, amount: Money) -> Result<TopUpIntent> {
        if !amount.is_positive() {
            return Err(EngineError::InvalidAmount(format!(
                "top-up amount {} must be positive",
                amount
            )));
        }
        self.ledger.open_wallet(user).await;
        let payment = Payment::pending(
            user,
            PaymentPurpose::TopUp,
            amount,
            PaymentMethod::Gateway,
            self.clock.now(),
        );
        let payment_id = payment.id;
        self.payments.insert(payment.clone()).await;
        let intent = self
            .create_intent(&payment, "wallet top-up".to_string())
            .await?;
        info!(user, payment = %payment_id, %amount, "top-up opened");
        Ok(TopUpIntent {
            schema_version: SCHEMA_VERSION,
            payment_id,
            intent_id: intent.id,
            client_secret: intent.client_secret,
        })
    }

    /// Opens the intent for a freshly stored payment. The payment is failed
    /// if the gateway cannot be reached, so a retry starts a new attempt.
    async fn create_intent(&self, payment: &Payment, description: String) -> Result<Intent> {
        match self.request_intent(payment, description).await {
            Ok(intent) => Ok(intent),
            Err(e) => {
                self.payments
                    .transition(payment.id, PaymentStatus::Failed, self.clock.now())
                    .await?;
                warn!(payment = %payment.id, error = %e, "intent creation failed");
                Err(e)
            }
        }
    }

    async fn request_intent(&self, payment: &Payment, description: String) -> Result<Intent> {
        let metadata = IntentMetadata {
            idempotency_key: payment.id.to_string(),
            user_id: payment.user_id,
            description,
        };
        let intent = self
            .gateway
            .create_intent(payment.amount, &self.config.currency, metadata)
            .await?;
        self.payments.attach_intent(payment.id, &intent).await?;
        Ok(intent)
    }

    /// Second phase of a gateway checkout or top-up.
    pub async fn confirm_payment(&self, user: UserId, payment_id: PaymentId) -> Result<ConfirmOutcome> {
        let payment = self.payments.get(payment_id).await?;
        if payment.user_id != user {
            return Err(EngineError::NotFound(format!("payment {}", payment_id)));
        }
        match payment.status {
            PaymentStatus::Pending => {}
            PaymentStatus::Succeeded => return self.settled_outcome(&payment).await,
            PaymentStatus::Failed => return self.recheck_failed(&payment).await,
            PaymentStatus::Refunded => {
                return Err(EngineError::DataIntegrity(format!(
                    "payment {} was already refunded",
                    payment_id
                )))
            }
        }
        if payment.method == PaymentMethod::Wallet {
            return Ok(ConfirmOutcome::Pending { payment_id });
        }
        let intent_id = payment.gateway_intent_id.as_deref().ok_or_else(|| {
            EngineError::DataIntegrity(format!("gateway payment {} has no intent", payment_id))
        })?;
        let confirmation = self.gateway.confirm_intent(intent_id).await?;
        debug!(payment = %payment_id, raw = %confirmation.raw, "gateway confirmation");
        match confirmation.status {
            IntentStatus::Pending => Ok(ConfirmOutcome::Pending { payment_id }),
            IntentStatus::Failed => {
                match self
                    .payments
                    .transition(payment_id, PaymentStatus::Failed, self.clock.now())
                    .await?
                {
                    Transition::Applied(_) => {
                        info!(user, payment = %payment_id, "card payment declined");
                        Err(EngineError::PaymentDeclined(payment_id))
                    }
                    Transition::Rejected(current) if current.status == PaymentStatus::Failed => {
                        Err(EngineError::PaymentDeclined(payment_id))
                    }
                    Transition::Rejected(current) => self.settled_outcome(&current).await,
                }
            }
            IntentStatus::Succeeded => match payment.purpose {
                PaymentPurpose::Registration(_) => self.settle_registration(payment_id).await,
                PaymentPurpose::TopUp => self.settle_top_up(payment_id).await,
            },
        }
    }

    /// Marks a captured payment succeeded and creates its registration. If
    /// the registration cannot be created the capture is credited back.
    async fn settle_registration(&self, payment_id: PaymentId) -> Result<ConfirmOutcome> {
        let now = self.clock.now();
        let payment = match self
            .payments
            .transition(payment_id, PaymentStatus::Succeeded, now)
            .await?
        {
            Transition::Applied(payment) => payment,
            Transition::Rejected(current) => return self.lost_settlement(&current).await,
        };
        let event = payment_event(&payment)?.clone();
        match self
            .create_registration(payment.user_id, &event, Some(payment_id))
            .await
        {
            Ok(registration) => {
                info!(user = payment.user_id, %event, payment = %payment_id, amount = %payment.amount, "registration settled");
                Ok(ConfirmOutcome::Registered { registration })
            }
            Err(cause) => {
                warn!(user = payment.user_id, %event, payment = %payment_id, error = %cause, "registration failed after payment, reversing");
                let credited = self.reverse_payment(&payment).await?;
                Err(EngineError::RegistrationReversed {
                    payment: payment_id,
                    credited,
                    cause: Box::new(cause),
                })
            }
        }
    }

    async fn settle_top_up(&self, payment_id: PaymentId) -> Result<ConfirmOutcome> {
        let payment = match self
            .payments
            .transition(payment_id, PaymentStatus::Succeeded, self.clock.now())
            .await?
        {
            Transition::Applied(payment) => payment,
            Transition::Rejected(current) => return self.lost_settlement(&current).await,
        };
        self.deposit_top_up(&payment).await
    }

    /// Re-appending a deposit is a no-op thanks to the payment correlation,
    /// so this serves both first settlement and repeated confirmation.
    async fn deposit_top_up(&self, payment: &Payment) -> Result<ConfirmOutcome> {
        self.ledger.open_wallet(payment.user_id).await;
        let deposit = NewTransaction::new(
            TransactionType::Deposit,
            payment.amount,
            "wallet top-up",
            payment.confirmed_at.unwrap_or_else(|| self.clock.now()),
        )
        .for_payment(payment.id);
        let transaction = self.ledger.append_transaction(payment.user_id, deposit).await?;
        let balance = self.ledger.get_balance(payment.user_id).await?;
        info!(user = payment.user_id, payment = %payment.id, amount = %payment.amount, %balance, "top-up deposited");
        Ok(ConfirmOutcome::Deposited {
            transaction,
            balance,
        })
    }

    /// A captured payment whose status was moved by someone else first.
    async fn lost_settlement(&self, current: &Payment) -> Result<ConfirmOutcome> {
        match current.status {
            PaymentStatus::Succeeded => self.settled_outcome(current).await,
            PaymentStatus::Failed => {
                self.credit_expired_capture(current).await?;
                Err(EngineError::PaymentExpired(current.id))
            }
            status => Err(EngineError::DataIntegrity(format!(
                "payment {} cannot settle from {}",
                current.id, status
            ))),
        }
    }

    async fn settled_outcome(&self, payment: &Payment) -> Result<ConfirmOutcome> {
        match &payment.purpose {
            PaymentPurpose::Registration(event) => {
                match self.registry.find_registration(payment.user_id, event).await? {
                    Some(registration) => Ok(ConfirmOutcome::Registered { registration }),
                    // Another confirmation is still creating the record.
                    None => Ok(ConfirmOutcome::Pending {
                        payment_id: payment.id,
                    }),
                }
            }
            PaymentPurpose::TopUp => self.deposit_top_up(payment).await,
        }
    }

    /// A failed gateway payment may still have been captured if the card
    /// holder finished after the sweep. Such captures go to the wallet.
    async fn recheck_failed(&self, payment: &Payment) -> Result<ConfirmOutcome> {
        if let (PaymentMethod::Gateway, Some(intent_id)) =
            (payment.method, payment.gateway_intent_id.as_deref())
        {
            let confirmation = self.gateway.confirm_intent(intent_id).await?;
            if confirmation.status == IntentStatus::Succeeded {
                self.credit_expired_capture(payment).await?;
                return Err(EngineError::PaymentExpired(payment.id));
            }
        }
        Err(EngineError::PaymentDeclined(payment.id))
    }

    async fn credit_expired_capture(&self, payment: &Payment) -> Result<Money> {
        self.ledger.open_wallet(payment.user_id).await;
        let mut credit = NewTransaction::new(
            TransactionType::Refund,
            payment.amount,
            format!("credit for payment {} captured after expiry", payment.id),
            self.clock.now(),
        )
        .for_payment(payment.id);
        if let Some(event) = payment.event() {
            credit = credit.for_event(event.clone());
        }
        self.ledger.append_transaction(payment.user_id, credit).await?;
        warn!(user = payment.user_id, payment = %payment.id, amount = %payment.amount, "late capture credited to wallet");
        Ok(payment.amount)
    }

    /// Credits a succeeded payment back to the wallet and marks it refunded.
    async fn reverse_payment(&self, payment: &Payment) -> Result<Money> {
        let now = self.clock.now();
        self.ledger.open_wallet(payment.user_id).await;
        let mut refund = NewTransaction::new(
            TransactionType::Refund,
            payment.amount,
            match payment.event() {
                Some(event) => format!("refund for {}", event),
                None => "refund".to_string(),
            },
            now,
        )
        .for_payment(payment.id);
        if let Some(event) = payment.event() {
            refund = refund.for_event(event.clone());
        }
        self.ledger.append_transaction(payment.user_id, refund).await?;
        match self
            .payments
            .transition(payment.id, PaymentStatus::Refunded, now)
            .await?
        {
            Transition::Applied(_) => Ok(payment.amount),
            Transition::Rejected(current) if current.status == PaymentStatus::Refunded => {
                Ok(payment.amount)
            }
            Transition::Rejected(current) => {
                error!(payment = %payment.id, status = %current.status, "refund recorded for payment that is not refundable");
                Err(EngineError::DataIntegrity(format!(
                    "refund recorded for {} payment {}",
                    current.status, payment.id
                )))
            }
        }
    }

    pub async fn cancel_registration(&self, user: UserId, event: &EventKey) -> Result<CancelOutcome> {
        let registration = self
            .registry
            .find_registration(user, event)
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("registration of user {} for {}", user, event))
            })?;
        let Some(payment_id) = registration.payment_id else {
            self.remove_registration(user, event).await?;
            info!(user, %event, "free registration cancelled");
            return Ok(CancelOutcome {
                schema_version: SCHEMA_VERSION,
                refunded: Money::ZERO,
                balance: None,
            });
        };
        let payment = self.payments.get(payment_id).await?;
        match payment.status {
            PaymentStatus::Succeeded => {}
            // A previous cancellation refunded but could not remove the record.
            PaymentStatus::Refunded => return self.finish_cancellation(&payment).await,
            status => {
                return Err(EngineError::DataIntegrity(format!(
                    "registration of user {} for {} references {} payment {}",
                    user, event, status, payment_id
                )))
            }
        }

        let schedule = self.catalog.event_schedule(event).await?;
        let now = self.clock.now();
        match policy::evaluate(&schedule, payment.amount, now, self.config.refund_window()) {
            RefundDecision::NotApplicable => {
                self.remove_registration(user, event).await?;
                Ok(CancelOutcome {
                    schema_version: SCHEMA_VERSION,
                    refunded: Money::ZERO,
                    balance: None,
                })
            }
            RefundDecision::UnparsableCutoff => {
                error!(user, %event, ?schedule, "event has no readable end or start time, refund denied");
                Err(EngineError::DataIntegrity(format!(
                    "event {} has no readable end or start time",
                    event
                )))
            }
            RefundDecision::WindowClosed { deadline } => {
                info!(user, %event, %deadline, "cancellation denied, refund window closed");
                Err(EngineError::RefundWindowClosed { deadline })
            }
            RefundDecision::Eligible { .. } => {
                let refunded = self.reverse_payment(&payment).await?;
                info!(user, %event, payment = %payment_id, amount = %refunded, "cancellation refunded");
                self.finish_cancellation(&payment).await
            }
        }
    }

    async fn finish_cancellation(&self, payment: &Payment) -> Result<CancelOutcome> {
        let event = payment_event(payment)?;
        if let Err(e) = self.remove_registration(payment.user_id, event).await {
            return Err(EngineError::CancellationIncomplete {
                payment: payment.id,
                refunded: payment.amount,
                reason: e.to_string(),
            });
        }
        Ok(CancelOutcome {
            schema_version: SCHEMA_VERSION,
            refunded: payment.amount,
            balance: self.ledger.get_balance(payment.user_id).await.ok(),
        })
    }

    /// Retries the delete with a linear backoff. Deletion of an absent record
    /// counts as success, so retrying is safe.
    async fn remove_registration(&self, user: UserId, event: &EventKey) -> Result<()> {
        let attempts = self.config.delete_retry_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.registry.delete_registration(user, event).await {
                Ok(()) => {
                    self.release_slot(event).await;
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!(user, %event, attempt, error = %e, "registration delete failed, retrying");
                    tokio::time::sleep(self.config.delete_retry_delay() * attempt).await;
                }
                Err(e) => {
                    error!(user, %event, attempt, error = %e, "registration delete failed");
                    return Err(e);
                }
            }
        }
    }

    async fn create_registration(
        &self,
        user: UserId,
        event: &EventKey,
        payment: Option<PaymentId>,
    ) -> Result<Registration> {
        self.registry.reserve_slot(event).await?;
        let registration = Registration::new(user, event.clone(), payment, self.clock.now());
        if let Err(e) = self.registry.create_registration(registration.clone()).await {
            self.release_slot(event).await;
            return Err(e);
        }
        Ok(registration)
    }

    async fn release_slot(&self, event: &EventKey) {
        if let Err(e) = self.registry.release_slot(event).await {
            warn!(%event, error = %e, "slot release failed");
        }
    }

    /// Fails pending payments older than the configured timeout. Gateway
    /// payments are checked with the provider first and settled if it
    /// reports success. Also finishes cancellations that were refunded but
    /// whose registration could not be removed at the time.
    pub async fn sweep_stale_payments(&self) -> SweepReport {
        let mut report = SweepReport::default();
        self.expire_stale_payments(&mut report).await;
        self.reconcile_cancellations(&mut report).await;
        if !report.expired.is_empty() || !report.settled.is_empty() || !report.reconciled.is_empty() {
            info!(
                expired = report.expired.len(),
                settled = report.settled.len(),
                reconciled = report.reconciled.len(),
                "stale payments swept"
            );
        }
        report
    }

    async fn expire_stale_payments(&self, report: &mut SweepReport) {
        let now = self.clock.now();
        let Some(cutoff) = now.checked_sub_signed(self.config.pending_timeout()) else {
            warn!(%now, timeout_secs = self.config.pending_timeout_secs, "pending timeout reaches past the calendar, nothing to expire");
            return;
        };
        for payment_id in self.payments.pending_created_before(cutoff).await {
            let Ok(payment) = self.payments.get(payment_id).await else {
                continue;
            };
            if let Some(intent_id) = payment.gateway_intent_id.as_deref() {
                match self.gateway.confirm_intent(intent_id).await {
                    Ok(confirmation) if confirmation.status == IntentStatus::Succeeded => {
                        match self.confirm_payment(payment.user_id, payment_id).await {
                            Ok(_) => report.settled.push(payment_id),
                            Err(e) => warn!(payment = %payment_id, error = %e, "stale payment settlement failed"),
                        }
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(payment = %payment_id, error = %e, "gateway check failed during sweep")
                    }
                }
            }
            match self
                .payments
                .transition(payment_id, PaymentStatus::Failed, self.clock.now())
                .await
            {
                Ok(Transition::Applied(_)) => report.expired.push(payment_id),
                Ok(Transition::Rejected(_)) => {}
                Err(e) => warn!(payment = %payment_id, error = %e, "stale payment expiry failed"),
            }
        }
    }

    /// A refunded payment must not leave its registration behind.
    async fn reconcile_cancellations(&self, report: &mut SweepReport) {
        for payment in self.payments.refunded_registrations().await {
            let Some(event) = payment.event() else {
                continue;
            };
            match self.registry.find_registration(payment.user_id, event).await {
                Ok(Some(registration)) if registration.payment_id == Some(payment.id) => {}
                Ok(_) => continue,
                Err(e) => {
                    debug!(payment = %payment.id, error = %e, "registration lookup failed during sweep");
                    continue;
                }
            }
            match self.finish_cancellation(&payment).await {
                Ok(_) => {
                    info!(user = payment.user_id, %event, payment = %payment.id, "refunded registration removed");
                    report.reconciled.push(payment.id);
                }
                Err(e) => warn!(payment = %payment.id, error = %e, "refunded registration still present"),
            }
        }
    }
}

fn payment_event(payment: &Payment) -> Result<&EventKey> {
    payment.event().ok_or_else(|| {
        EngineError::DataIntegrity(format!("payment {} is not for an event", payment.id))
    })
}

#[cfg(test)]
#[allow(unused)]
mod test {
    use super::*;
    use crate::catalog::InMemoryCatalog;
    use crate::clock::ManualClock;
    use crate::gateway::SimulatedGateway;
    use crate::policy::EventSchedule;
    use crate::registry::InMemoryRegistry;
    use crate::types::EventType;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct Harness {
        service: Arc<SettlementService>,
        gateway: Arc<SimulatedGateway>,
        catalog: Arc<InMemoryCatalog>,
        registry: Arc<InMemoryRegistry>,
        clock: Arc<ManualClock>,
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 4, 1, 10, 0, 0).unwrap()
    }
    fn money(amount: Decimal) -> Money {
        Money::from_decimal(amount).unwrap()
    }
    fn workshop(id: &str) -> EventKey {
        EventKey::new(EventType::Workshop, id)
    }
    fn trip(id: &str) -> EventKey {
        EventKey::new(EventType::Trip, id)
    }

    fn harness() -> Harness {
        harness_with(EngineConfig {
            delete_retry_delay_ms: 1,
            ..EngineConfig::default()
        })
    }

    fn harness_with(config: EngineConfig) -> Harness {
        let gateway = Arc::new(SimulatedGateway::new(config.gateway_min_charge));
        let catalog = Arc::new(InMemoryCatalog::new());
        let registry = Arc::new(InMemoryRegistry::new());
        let clock = Arc::new(ManualClock::new(start()));
        let service = SettlementService::new(
            config,
            Arc::new(WalletLedger::new()),
            gateway.clone(),
            catalog.clone(),
            registry.clone(),
        )
        .with_clock(clock.clone());
        Harness {
            service: Arc::new(service),
            gateway,
            catalog,
            registry,
            clock,
        }
    }

    impl Harness {
        async fn event(&self, event: &EventKey, price: Decimal, ends_in_days: i64) {
            let ends = start() + Duration::days(ends_in_days);
            self.catalog
                .insert(
                    event.clone(),
                    money(price),
                    EventSchedule {
                        starts_at: Some((ends - Duration::hours(3)).to_rfc3339()),
                        ends_at: Some(ends.to_rfc3339()),
                    },
                )
                .await;
        }
        async fn fund(&self, user: UserId, amount: Decimal) {
            let ledger = self.service.ledger();
            ledger.open_wallet(user).await;
            if amount > dec!(0) {
                ledger
                    .append_transaction(
                        user,
                        NewTransaction::new(TransactionType::Deposit, money(amount), "seed", start()),
                    )
                    .await
                    .unwrap();
            }
        }
        async fn balance(&self, user: UserId) -> Money {
            self.service.ledger().get_balance(user).await.unwrap()
        }
        async fn registered(&self, user: UserId, event: &EventKey) -> bool {
            self.registry.find_registration(user, event).await.unwrap().is_some()
        }
        async fn assert_ledger_consistent(&self) {
            for (_, snapshot) in self.service.ledger().shutdown().await {
                assert_eq!(snapshot.balance, snapshot.ledger_total);
                assert!(!snapshot.balance.is_negative());
            }
        }
    }

    fn registered_payment(outcome: &RegisterOutcome) -> PaymentId {
        match outcome {
            RegisterOutcome::Registered { registration } => registration.payment_id.unwrap(),
            other => panic!("expected registration, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_wallet_cannot_pay() {
        let h = harness();
        let w1 = workshop("W1");
        h.event(&w1, dec!(50), 30).await;
        h.fund(1, dec!(0)).await;
        let err = h
            .service
            .register_for_event(1, &w1, PaymentMethod::Wallet)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
        assert!(!h.registered(1, &w1).await);
        assert_eq!(h.registry.taken(&w1).await, 0);
        assert_eq!(h.balance(1).await, Money::ZERO);
        assert_eq!(h.service.pending_payment(1, &w1).await, None);
        h.assert_ledger_consistent().await;
    }

    #[tokio::test]
    async fn wallet_payment_registers() {
        let h = harness();
        let w1 = workshop("W1");
        h.event(&w1, dec!(50), 30).await;
        h.fund(1, dec!(100)).await;
        let outcome = h
            .service
            .register_for_event(1, &w1, PaymentMethod::Wallet)
            .await
            .unwrap();
        let payment_id = registered_payment(&outcome);
        assert_eq!(h.balance(1).await, money(dec!(50)));
        let history = h.service.ledger().history(1, None).await.unwrap();
        assert_eq!(history[0].tx_type, TransactionType::Payment);
        assert_eq!(history[0].amount, money(dec!(-50)));
        assert_eq!(history[0].related_payment_id, Some(payment_id));
        assert_eq!(history[0].event, Some(w1.clone()));
        let payment = h.service.payment(payment_id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Succeeded);
        assert_eq!(payment.confirmed_at, Some(start()));
        assert!(h.registered(1, &w1).await);
        assert_eq!(h.registry.registration_count().await, 1);
        h.assert_ledger_consistent().await;
    }

    #[tokio::test]
    async fn free_event_skips_payment() {
        let h = harness();
        let bazaar = EventKey::new(EventType::Bazaar, "B1");
        h.event(&bazaar, dec!(0), 3).await;
        let outcome = h
            .service
            .register_for_event(4, &bazaar, PaymentMethod::Gateway)
            .await
            .unwrap();
        match outcome {
            RegisterOutcome::Registered { registration } => {
                assert_eq!(registration.payment_id, None);
                assert_eq!(registration.certificate_sent, None);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.gateway.intent_count().await, 0);
        // Free cancellations ignore the refund window.
        let cancelled = h.service.cancel_registration(4, &bazaar).await.unwrap();
        assert_eq!(cancelled.refunded, Money::ZERO);
        assert!(!h.registered(4, &bazaar).await);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let h = harness();
        let w1 = workshop("W1");
        h.event(&w1, dec!(50), 30).await;
        h.fund(1, dec!(200)).await;
        h.service.register_for_event(1, &w1, PaymentMethod::Wallet).await.unwrap();
        assert!(matches!(
            h.service.register_for_event(1, &w1, PaymentMethod::Wallet).await,
            Err(EngineError::AlreadyRegistered { .. })
        ));
        assert_eq!(h.balance(1).await, money(dec!(150)));
    }

    #[tokio::test]
    async fn gateway_checkout_is_two_phase() {
        let h = harness();
        let t1 = trip("T1");
        h.event(&t1, dec!(200), 40).await;
        let outcome = h
            .service
            .register_for_event(2, &t1, PaymentMethod::Gateway)
            .await
            .unwrap();
        let (payment_id, intent_id) = match outcome {
            RegisterOutcome::AwaitingConfirmation {
                payment_id,
                intent_id,
                client_secret,
            } => {
                assert!(!client_secret.is_empty());
                (payment_id, intent_id)
            }
            other => panic!("unexpected {:?}", other),
        };

        let early = h.service.confirm_payment(2, payment_id).await.unwrap();
        assert_eq!(early, ConfirmOutcome::Pending { payment_id });
        assert!(!h.registered(2, &t1).await);
        assert_eq!(
            h.service.payment(payment_id).await.unwrap().status,
            PaymentStatus::Pending
        );

        assert!(h.gateway.approve(&intent_id).await);
        match h.service.confirm_payment(2, payment_id).await.unwrap() {
            ConfirmOutcome::Registered { registration } => {
                assert_eq!(registration.payment_id, Some(payment_id))
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            h.service.payment(payment_id).await.unwrap().status,
            PaymentStatus::Succeeded
        );
        assert!(h.registered(2, &t1).await);

        // Confirming again reports the same registration.
        assert!(matches!(
            h.service.confirm_payment(2, payment_id).await,
            Ok(ConfirmOutcome::Registered { .. })
        ));
    }

    #[tokio::test]
    async fn reopening_checkout_reuses_intent() {
        let h = harness();
        let t1 = trip("T1");
        h.event(&t1, dec!(200), 40).await;
        let first = h.service.register_for_event(2, &t1, PaymentMethod::Gateway).await.unwrap();
        let second = h.service.register_for_event(2, &t1, PaymentMethod::Gateway).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.gateway.intent_count().await, 1);
    }

    #[tokio::test]
    async fn declined_card_fails_payment() {
        let h = harness();
        let t1 = trip("T1");
        h.event(&t1, dec!(200), 40).await;
        let Ok(RegisterOutcome::AwaitingConfirmation { payment_id, intent_id, .. }) =
            h.service.register_for_event(2, &t1, PaymentMethod::Gateway).await
        else {
            panic!("expected checkout");
        };
        h.gateway.decline(&intent_id).await;
        assert_eq!(
            h.service.confirm_payment(2, payment_id).await,
            Err(EngineError::PaymentDeclined(payment_id))
        );
        assert_eq!(
            h.service.payment(payment_id).await.unwrap().status,
            PaymentStatus::Failed
        );
        assert!(!h.registered(2, &t1).await);
    }

    #[tokio::test]
    async fn confirm_by_other_user_is_not_found() {
        let h = harness();
        let t1 = trip("T1");
        h.event(&t1, dec!(200), 40).await;
        let Ok(RegisterOutcome::AwaitingConfirmation { payment_id, .. }) =
            h.service.register_for_event(2, &t1, PaymentMethod::Gateway).await
        else {
            panic!("expected checkout");
        };
        assert!(matches!(
            h.service.confirm_payment(3, payment_id).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn gateway_outage_fails_attempt_and_retry_works() {
        let h = harness();
        let t1 = trip("T1");
        h.event(&t1, dec!(200), 40).await;
        h.gateway.fail_next(1).await;
        let err = h
            .service
            .register_for_event(2, &t1, PaymentMethod::Gateway)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(h.service.pending_payment(2, &t1).await, None);
        assert!(matches!(
            h.service.register_for_event(2, &t1, PaymentMethod::Gateway).await,
            Ok(RegisterOutcome::AwaitingConfirmation { .. })
        ));
    }

    #[tokio::test]
    async fn outage_during_confirm_keeps_payment_pending() {
        let h = harness();
        let t1 = trip("T1");
        h.event(&t1, dec!(200), 40).await;
        let Ok(RegisterOutcome::AwaitingConfirmation { payment_id, intent_id, .. }) =
            h.service.register_for_event(2, &t1, PaymentMethod::Gateway).await
        else {
            panic!("expected checkout");
        };
        h.gateway.approve(&intent_id).await;
        h.gateway.fail_next(1).await;
        assert!(matches!(
            h.service.confirm_payment(2, payment_id).await,
            Err(EngineError::GatewayUnavailable(_))
        ));
        assert_eq!(
            h.service.payment(payment_id).await.unwrap().status,
            PaymentStatus::Pending
        );
        assert!(matches!(
            h.service.confirm_payment(2, payment_id).await,
            Ok(ConfirmOutcome::Registered { .. })
        ));
    }

    #[tokio::test]
    async fn eligible_cancellation_refunds_to_wallet() {
        let h = harness();
        let w1 = workshop("W1");
        h.event(&w1, dec!(50), 20).await;
        h.fund(1, dec!(100)).await;
        let payment_id =
            registered_payment(&h.service.register_for_event(1, &w1, PaymentMethod::Wallet).await.unwrap());
        let outcome = h.service.cancel_registration(1, &w1).await.unwrap();
        assert_eq!(outcome.refunded, money(dec!(50)));
        assert_eq!(outcome.balance, Some(money(dec!(100))));
        assert_eq!(h.balance(1).await, money(dec!(100)));
        assert_eq!(
            h.service.payment(payment_id).await.unwrap().status,
            PaymentStatus::Refunded
        );
        assert!(!h.registered(1, &w1).await);
        assert_eq!(h.registry.taken(&w1).await, 0);
        let history = h.service.ledger().history(1, None).await.unwrap();
        assert_eq!(history[0].tx_type, TransactionType::Refund);
        assert_eq!(history[0].related_payment_id, Some(payment_id));
        h.assert_ledger_consistent().await;
    }

    #[tokio::test]
    async fn late_cancellation_is_denied() {
        let h = harness();
        let w1 = workshop("W1");
        h.event(&w1, dec!(50), 5).await;
        h.fund(1, dec!(100)).await;
        let payment_id =
            registered_payment(&h.service.register_for_event(1, &w1, PaymentMethod::Wallet).await.unwrap());
        let err = h.service.cancel_registration(1, &w1).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::RefundWindowClosed {
                deadline: start() + Duration::days(5) - Duration::days(14)
            }
        );
        assert!(err.is_business_outcome());
        assert_eq!(h.balance(1).await, money(dec!(50)));
        assert!(h.registered(1, &w1).await);
        assert_eq!(
            h.service.payment(payment_id).await.unwrap().status,
            PaymentStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn cancellation_at_the_deadline_is_denied() {
        let h = harness();
        let w1 = workshop("W1");
        h.event(&w1, dec!(50), 20).await;
        h.fund(1, dec!(50)).await;
        h.service.register_for_event(1, &w1, PaymentMethod::Wallet).await.unwrap();
        h.clock.set(start() + Duration::days(6));
        assert!(matches!(
            h.service.cancel_registration(1, &w1).await,
            Err(EngineError::RefundWindowClosed { .. })
        ));
        h.clock.set(start() + Duration::days(6) - Duration::seconds(1));
        assert!(h.service.cancel_registration(1, &w1).await.is_ok());
    }

    #[tokio::test]
    async fn card_payment_refunds_to_wallet() {
        let h = harness();
        let t1 = trip("T1");
        h.event(&t1, dec!(200), 40).await;
        let Ok(RegisterOutcome::AwaitingConfirmation { payment_id, intent_id, .. }) =
            h.service.register_for_event(2, &t1, PaymentMethod::Gateway).await
        else {
            panic!("expected checkout");
        };
        h.gateway.approve(&intent_id).await;
        h.service.confirm_payment(2, payment_id).await.unwrap();
        let outcome = h.service.cancel_registration(2, &t1).await.unwrap();
        assert_eq!(outcome.refunded, money(dec!(200)));
        assert_eq!(h.balance(2).await, money(dec!(200)));
    }

    #[tokio::test]
    async fn unreadable_event_time_denies_refund() {
        let h = harness();
        let w1 = workshop("W1");
        h.catalog
            .insert(w1.clone(), money(dec!(50)), EventSchedule::new(Some("soon"), None))
            .await;
        h.fund(1, dec!(50)).await;
        h.service.register_for_event(1, &w1, PaymentMethod::Wallet).await.unwrap();
        let err = h.service.cancel_registration(1, &w1).await.unwrap_err();
        assert!(matches!(err, EngineError::DataIntegrity(_)));
        assert!(h.registered(1, &w1).await);
        assert_eq!(h.balance(1).await, Money::ZERO);
    }

    #[tokio::test]
    async fn lost_capacity_race_reverses_payment() {
        let h = harness();
        let w1 = workshop("W1");
        h.event(&w1, dec!(50), 30).await;
        h.registry.set_capacity(w1.clone(), Some(1)).await;
        h.fund(1, dec!(50)).await;
        h.fund(2, dec!(50)).await;
        h.service.register_for_event(1, &w1, PaymentMethod::Wallet).await.unwrap();
        let err = h
            .service
            .register_for_event(2, &w1, PaymentMethod::Wallet)
            .await
            .unwrap_err();
        match err {
            EngineError::RegistrationReversed {
                payment,
                credited,
                cause,
            } => {
                assert_eq!(credited, money(dec!(50)));
                assert_eq!(*cause, EngineError::CapacityExceeded(w1.clone()));
                assert_eq!(
                    h.service.payment(payment).await.unwrap().status,
                    PaymentStatus::Refunded
                );
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.balance(2).await, money(dec!(50)));
        assert!(!h.registered(2, &w1).await);
        assert_eq!(h.registry.taken(&w1).await, 1);
        h.assert_ledger_consistent().await;
    }

    #[tokio::test]
    async fn failed_delete_is_retried() {
        let h = harness();
        let w1 = workshop("W1");
        h.event(&w1, dec!(50), 30).await;
        h.fund(1, dec!(50)).await;
        h.service.register_for_event(1, &w1, PaymentMethod::Wallet).await.unwrap();
        h.registry.fail_next_deletes(2).await;
        let outcome = h.service.cancel_registration(1, &w1).await.unwrap();
        assert_eq!(outcome.refunded, money(dec!(50)));
        assert!(!h.registered(1, &w1).await);
    }

    #[tokio::test]
    async fn incomplete_cancellation_finishes_exactly_once() {
        let h = harness();
        let w1 = workshop("W1");
        h.event(&w1, dec!(50), 30).await;
        h.fund(1, dec!(50)).await;
        h.service.register_for_event(1, &w1, PaymentMethod::Wallet).await.unwrap();
        h.registry.fail_next_deletes(5).await;
        let err = h.service.cancel_registration(1, &w1).await.unwrap_err();
        assert!(matches!(err, EngineError::CancellationIncomplete { .. }));
        assert!(err.is_retryable());
        assert_eq!(h.balance(1).await, money(dec!(50)));
        assert!(h.registered(1, &w1).await);

        let outcome = h.service.cancel_registration(1, &w1).await.unwrap();
        assert_eq!(outcome.refunded, money(dec!(50)));
        assert_eq!(h.balance(1).await, money(dec!(50)));
        assert!(!h.registered(1, &w1).await);
        assert_eq!(h.service.ledger().history(1, None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn concurrent_wallet_registrations_spend_once() {
        let h = harness();
        let events: Vec<EventKey> = (0..8).map(|i| workshop(&format!("W{}", i))).collect();
        for event in &events {
            h.event(event, dec!(50), 30).await;
        }
        h.fund(1, dec!(50)).await;
        let mut handles = vec![];
        for event in events.clone() {
            let service = h.service.clone();
            handles.push(tokio::spawn(async move {
                service.register_for_event(1, &event, PaymentMethod::Wallet).await
            }));
        }
        let mut registered = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => registered += 1,
                Err(EngineError::InsufficientFunds { .. }) => {}
                Err(e) => panic!("unexpected {:?}", e),
            }
        }
        assert_eq!(registered, 1);
        assert_eq!(h.balance(1).await, Money::ZERO);
        assert_eq!(h.registry.registration_count().await, 1);
    }

    #[tokio::test]
    async fn top_up_deposits_once() {
        let h = harness();
        let intent = h.service.begin_top_up(5, money(dec!(75.25))).await.unwrap();
        assert_eq!(
            h.service.confirm_payment(5, intent.payment_id).await,
            Ok(ConfirmOutcome::Pending {
                payment_id: intent.payment_id
            })
        );
        h.gateway.approve(&intent.intent_id).await;
        match h.service.confirm_payment(5, intent.payment_id).await.unwrap() {
            ConfirmOutcome::Deposited { transaction, balance } => {
                assert_eq!(transaction.tx_type, TransactionType::Deposit);
                assert_eq!(balance, money(dec!(75.25)));
            }
            other => panic!("unexpected {:?}", other),
        }
        h.service.confirm_payment(5, intent.payment_id).await.unwrap();
        assert_eq!(h.balance(5).await, money(dec!(75.25)));
        let summary = h.service.wallet_summary(5).await.unwrap();
        assert_eq!(summary.recent_transactions.len(), 1);
        assert_eq!(summary.schema_version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn top_up_below_minimum_is_invalid() {
        let h = harness();
        assert!(matches!(
            h.service.begin_top_up(5, money(dec!(0.10))).await,
            Err(EngineError::InvalidAmount(_))
        ));
        assert!(matches!(
            h.service.begin_top_up(5, Money::ZERO).await,
            Err(EngineError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn sweep_expires_abandoned_checkouts() {
        let h = harness();
        let t1 = trip("T1");
        let t2 = trip("T2");
        h.event(&t1, dec!(200), 40).await;
        h.event(&t2, dec!(100), 40).await;
        let Ok(RegisterOutcome::AwaitingConfirmation { payment_id: abandoned, .. }) =
            h.service.register_for_event(2, &t1, PaymentMethod::Gateway).await
        else {
            panic!("expected checkout");
        };
        let Ok(RegisterOutcome::AwaitingConfirmation { payment_id: paid, intent_id, .. }) =
            h.service.register_for_event(2, &t2, PaymentMethod::Gateway).await
        else {
            panic!("expected checkout");
        };
        h.gateway.approve(&intent_id).await;

        h.clock.advance(Duration::minutes(30));
        assert_eq!(h.service.sweep_stale_payments().await, SweepReport::default());

        h.clock.advance(Duration::minutes(31));
        let report = h.service.sweep_stale_payments().await;
        assert_eq!(report.expired, vec![abandoned]);
        assert_eq!(report.settled, vec![paid]);
        assert_eq!(
            h.service.payment(abandoned).await.unwrap().status,
            PaymentStatus::Failed
        );
        assert!(h.registered(2, &t2).await);
        assert!(!h.registered(2, &t1).await);
    }

    #[tokio::test]
    async fn capture_after_expiry_is_credited() {
        let h = harness();
        let t1 = trip("T1");
        h.event(&t1, dec!(200), 40).await;
        let Ok(RegisterOutcome::AwaitingConfirmation { payment_id, intent_id, .. }) =
            h.service.register_for_event(2, &t1, PaymentMethod::Gateway).await
        else {
            panic!("expected checkout");
        };
        h.clock.advance(Duration::hours(2));
        h.service.sweep_stale_payments().await;
        h.gateway.approve(&intent_id).await;
        assert_eq!(
            h.service.confirm_payment(2, payment_id).await,
            Err(EngineError::PaymentExpired(payment_id))
        );
        // Asking again does not credit twice.
        assert_eq!(
            h.service.confirm_payment(2, payment_id).await,
            Err(EngineError::PaymentExpired(payment_id))
        );
        assert_eq!(h.balance(2).await, money(dec!(200)));
        assert!(!h.registered(2, &t1).await);
    }

    #[tokio::test]
    async fn sweep_finishes_incomplete_cancellation() {
        let h = harness();
        let w1 = workshop("W1");
        h.event(&w1, dec!(50), 30).await;
        h.fund(1, dec!(50)).await;
        let payment_id =
            registered_payment(&h.service.register_for_event(1, &w1, PaymentMethod::Wallet).await.unwrap());
        h.registry.fail_next_deletes(5).await;
        assert!(matches!(
            h.service.cancel_registration(1, &w1).await,
            Err(EngineError::CancellationIncomplete { .. })
        ));
        assert!(h.registered(1, &w1).await);

        let report = h.service.sweep_stale_payments().await;
        assert_eq!(report.reconciled, vec![payment_id]);
        assert!(!h.registered(1, &w1).await);
        assert_eq!(h.registry.taken(&w1).await, 0);
        assert_eq!(h.balance(1).await, money(dec!(50)));
        let history = h.service.ledger().history(1, None).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(
            history
                .iter()
                .filter(|tx| tx.tx_type == TransactionType::Refund)
                .count(),
            1
        );

        // Nothing left to do on the next pass.
        assert_eq!(h.service.sweep_stale_payments().await, SweepReport::default());
        assert!(matches!(
            h.service.cancel_registration(1, &w1).await,
            Err(EngineError::NotFound(_))
        ));
        h.assert_ledger_consistent().await;
    }

    #[tokio::test]
    async fn sweep_leaves_reversed_and_re_registered_seats_alone() {
        let h = harness();
        let w1 = workshop("W1");
        h.event(&w1, dec!(50), 30).await;
        h.fund(1, dec!(100)).await;
        h.service.register_for_event(1, &w1, PaymentMethod::Wallet).await.unwrap();
        h.service.cancel_registration(1, &w1).await.unwrap();
        let second =
            registered_payment(&h.service.register_for_event(1, &w1, PaymentMethod::Wallet).await.unwrap());

        assert_eq!(h.service.sweep_stale_payments().await, SweepReport::default());
        let registration = h.registry.find_registration(1, &w1).await.unwrap().unwrap();
        assert_eq!(registration.payment_id, Some(second));
    }

    #[tokio::test]
    async fn oversized_pending_timeout_does_not_expire() {
        let h = harness_with(EngineConfig {
            pending_timeout_secs: (i64::MAX / 1000) as u64,
            ..EngineConfig::default()
        });
        let intent = h.service.begin_top_up(5, money(dec!(20))).await.unwrap();
        h.clock.advance(Duration::days(365));
        assert_eq!(h.service.sweep_stale_payments().await, SweepReport::default());
        assert_eq!(
            h.service.payment(intent.payment_id).await.unwrap().status,
            PaymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn concurrent_checkouts_share_one_intent() {
        let h = harness();
        let t1 = trip("T1");
        h.event(&t1, dec!(200), 40).await;
        let mut handles = vec![];
        for _ in 0..4 {
            let service = h.service.clone();
            let event = t1.clone();
            handles.push(tokio::spawn(async move {
                service.register_for_event(2, &event, PaymentMethod::Gateway).await
            }));
        }
        let mut checkouts = vec![];
        for handle in handles {
            match handle.await.unwrap() {
                Ok(RegisterOutcome::AwaitingConfirmation {
                    payment_id,
                    intent_id,
                    ..
                }) => checkouts.push((payment_id, intent_id)),
                other => panic!("unexpected {:?}", other),
            }
        }
        checkouts.dedup();
        assert_eq!(checkouts.len(), 1);
        assert_eq!(h.gateway.intent_count().await, 1);
        assert_eq!(
            h.service.pending_payment(2, &t1).await.map(|p| p.id),
            Some(checkouts[0].0)
        );
    }
}
