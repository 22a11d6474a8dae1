use chrono::{DateTime, Duration, Utc};
use diesel::result::Error as DieselError;
use diesel::{Connection, ExpressionMethods, OptionalExtension, PgConnection, QueryDsl, RunQueryDsl};
use serde_json::Value;
use tracing::{error, warn};

use crate::database::models::{
    CheckoutSession, LedgerKind, NewPayment, Order, OrderStatus, Payment, PaymentProvider, PaymentStatus,
    SessionStatus,
};
use crate::database::{capacity, idgen, loyalty};
use crate::errors::ServiceError;

const SESSION_REF_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Merges a value into the audit blob without destroying prior entries.
/// Identical re-deliveries are dropped; a changed value for the same key is
/// stored under a numbered slot.
pub fn merge_payload(existing: Option<&Value>, key: &str, incoming: Value) -> Value {
    let mut map = match existing {
        Some(Value::Object(m)) => m.clone(),
        Some(other) => {
            let mut m = serde_json::Map::new();
            m.insert("previous".to_string(), other.clone());
            m
        }
        None => serde_json::Map::new(),
    };
    if map.values().any(|v| *v == incoming) {
        return Value::Object(map);
    }
    let mut slot = key.to_string();
    let mut n = 1;
    while map.contains_key(&slot) {
        n += 1;
        slot = format!("{key}_{n}");
    }
    map.insert(slot, incoming);
    Value::Object(map)
}

fn lock_order(conn: &mut PgConnection, req_order_id: i64) -> Result<Option<Order>, DieselError> {
    use crate::schema::orders::dsl::*;
    orders
        .filter(id.eq(req_order_id))
        .for_update()
        .first::<Order>(conn)
        .optional()
}

fn provider_payments(
    conn: &mut PgConnection,
    req_order_id: i64,
    req_provider: PaymentProvider,
) -> Result<Vec<Payment>, DieselError> {
    use crate::schema::payments::dsl::*;
    payments
        .filter(order_id.eq(req_order_id))
        .filter(provider.eq(req_provider.as_str()))
        .order(created_at.desc())
        .load::<Payment>(conn)
}

fn load_payment(conn: &mut PgConnection, payment_id: i64) -> Result<Payment, DieselError> {
    use crate::schema::payments::dsl::*;
    payments.filter(id.eq(payment_id)).first::<Payment>(conn)
}

fn set_order_status(conn: &mut PgConnection, req_order_id: i64, to: OrderStatus) -> Result<(), DieselError> {
    use crate::schema::orders::dsl::*;
    diesel::update(orders.filter(id.eq(req_order_id)))
        .set((status.eq(to.as_str()), updated_at.eq(Utc::now())))
        .execute(conn)?;
    Ok(())
}

fn set_session_status(conn: &mut PgConnection, req_session_id: i64, to: SessionStatus) -> Result<(), DieselError> {
    use crate::schema::checkout_sessions::dsl::*;
    diesel::update(checkout_sessions.filter(id.eq(req_session_id)))
        .set((status.eq(to.as_str()), updated_at.eq(Utc::now())))
        .execute(conn)?;
    Ok(())
}

fn lock_session(conn: &mut PgConnection, req_session_id: i64) -> Result<Option<CheckoutSession>, DieselError> {
    use crate::schema::checkout_sessions::dsl::*;
    checkout_sessions
        .filter(id.eq(req_session_id))
        .for_update()
        .first::<CheckoutSession>(conn)
        .optional()
}

// marks the newest PENDING attempt FAILED, or records a fresh FAILED row.
// Caller holds the order row lock and has ruled out a PAID payment.
fn fail_attempt_locked(
    conn: &mut PgConnection,
    order: &Order,
    req_provider: PaymentProvider,
    claimed_amount_cents: i64,
    claimed_currency: &str,
    webhook_payload: &Value,
    reason: &str,
) -> Result<Payment, ServiceError> {
    let now = Utc::now();
    let failure = serde_json::json!({ "reason": reason });
    let existing = provider_payments(conn, order.id, req_provider)?;

    if let Some(pending) = existing.iter().find(|p| p.is_status(PaymentStatus::Pending)) {
        let merged = merge_payload(pending.provider_payload.as_ref(), "webhook", webhook_payload.clone());
        let merged = merge_payload(Some(&merged), "failure", failure);
        {
            use crate::schema::payments::dsl::*;
            diesel::update(payments.filter(id.eq(pending.id)))
                .set((
                    status.eq(PaymentStatus::Failed.as_str()),
                    provider_payload.eq(merged),
                    updated_at.eq(now),
                ))
                .execute(conn)?;
        }
        return load_payment(conn, pending.id).map_err(Into::into);
    }

    let merged = merge_payload(None, "webhook", webhook_payload.clone());
    let merged = merge_payload(Some(&merged), "failure", failure);
    let record = NewPayment {
        id: idgen::next(),
        order_id: order.id,
        provider: req_provider.as_str().to_string(),
        status: PaymentStatus::Failed.as_str().to_string(),
        amount_cents: claimed_amount_cents,
        currency: claimed_currency.to_string(),
        session_ref: None,
        external_id: None,
        provider_payload: Some(merged),
        paid_at: None,
        created_at: now,
        updated_at: now,
    };
    {
        use crate::schema::payments::dsl::*;
        diesel::insert_into(payments).values(&record).execute(conn)?;
    }
    load_payment(conn, record.id).map_err(Into::into)
}

#[derive(Debug)]
pub enum FailOutcome {
    /// The attempt is now recorded as FAILED.
    Marked(Payment),
    /// A PAID payment already exists; nothing was touched.
    AlreadyPaid(Payment),
}

/// Records a definitively-failed webhook outcome (provider rejection or
/// amount mismatch). Idempotent against an already-confirmed payment: the
/// order row lock serializes this against a concurrent confirmation.
pub fn mark_payment_failed(
    conn: &mut PgConnection,
    req_order_id: i64,
    req_provider: PaymentProvider,
    claimed_amount_cents: i64,
    claimed_currency: &str,
    webhook_payload: &Value,
    reason: &str,
) -> Result<FailOutcome, ServiceError> {
    conn.transaction::<_, ServiceError, _>(|conn| {
        let order = lock_order(conn, req_order_id)?.ok_or(ServiceError::NotFound("order"))?;
        let existing = provider_payments(conn, order.id, req_provider)?;
        if let Some(paid) = existing.iter().find(|p| p.is_status(PaymentStatus::Paid)) {
            return Ok(FailOutcome::AlreadyPaid(paid.clone()));
        }
        let payment = fail_attempt_locked(
            conn,
            &order,
            req_provider,
            claimed_amount_cents,
            claimed_currency,
            webhook_payload,
            reason,
        )?;
        Ok(FailOutcome::Marked(payment))
    })
}

#[derive(Debug)]
pub enum ConfirmOutcome {
    Confirmed {
        payment: Payment,
        points_earned: i64,
        points_spent: i64,
    },
    /// Redelivered webhook; the first delivery already settled everything.
    AlreadyPaid(Payment),
    /// The sweeper cancelled the order first. The attempt is recorded as
    /// FAILED; the caller still acknowledges the webhook.
    OrderCancelled(Payment),
}

/// The reconciliation transaction. Under a single `FOR UPDATE` lock on the
/// order row it settles the payment, the order status, the checkout session
/// and the loyalty ledger, so any two deliveries for the same order serialize
/// here and the loser sees the winner's terminal state.
pub fn confirm_payment(
    conn: &mut PgConnection,
    req_order_id: i64,
    req_provider: PaymentProvider,
    req_external_id: &str,
    webhook_payload: &Value,
    points_validity_days: i64,
) -> Result<ConfirmOutcome, ServiceError> {
    conn.transaction::<_, ServiceError, _>(|conn| {
        let order = lock_order(conn, req_order_id)?.ok_or(ServiceError::NotFound("order"))?;

        let existing = provider_payments(conn, order.id, req_provider)?;
        if let Some(paid) = existing.iter().find(|p| p.is_status(PaymentStatus::Paid)) {
            return Ok(ConfirmOutcome::AlreadyPaid(paid.clone()));
        }

        if order.is_status(OrderStatus::Cancelled) {
            error!(
                order_number = %order.order_number,
                "verified payment arrived for a cancelled order, recording failed attempt"
            );
            let payment = fail_attempt_locked(
                conn,
                &order,
                req_provider,
                order.total_cents,
                &order.currency,
                webhook_payload,
                "order already cancelled",
            )?;
            return Ok(ConfirmOutcome::OrderCancelled(payment));
        }

        let now = Utc::now();

        let payment_id = match existing.iter().find(|p| p.is_status(PaymentStatus::Pending)) {
            Some(pending) => {
                let merged = merge_payload(pending.provider_payload.as_ref(), "webhook", webhook_payload.clone());
                use crate::schema::payments::dsl::*;
                diesel::update(payments.filter(id.eq(pending.id)))
                    .set((
                        status.eq(PaymentStatus::Paid.as_str()),
                        external_id.eq(req_external_id),
                        provider_payload.eq(merged),
                        paid_at.eq(now),
                        updated_at.eq(now),
                    ))
                    .execute(conn)?;
                pending.id
            }
            None => {
                let record = NewPayment {
                    id: idgen::next(),
                    order_id: order.id,
                    provider: req_provider.as_str().to_string(),
                    status: PaymentStatus::Paid.as_str().to_string(),
                    amount_cents: order.total_cents,
                    currency: order.currency.clone(),
                    session_ref: None,
                    external_id: Some(req_external_id.to_string()),
                    provider_payload: Some(merge_payload(None, "webhook", webhook_payload.clone())),
                    paid_at: Some(now),
                    created_at: now,
                    updated_at: now,
                };
                use crate::schema::payments::dsl::*;
                diesel::insert_into(payments).values(&record).execute(conn)?;
                record.id
            }
        };

        if !order.is_status(OrderStatus::Confirmed) {
            set_order_status(conn, order.id, OrderStatus::Confirmed)?;
        }

        let mut points_spent = 0i64;
        let mut points_earned = 0i64;

        if let Some(session_id) = order.checkout_session_id {
            if let Some(session) = lock_session(conn, session_id)? {
                if session.reserved_points > 0 {
                    if let Some(account) = order.customer_id {
                        if loyalty::find_order_entry(conn, order.id, LedgerKind::Spend)?.is_none() {
                            loyalty::ensure_account(conn, account)?;
                            match loyalty::record_spend(
                                conn,
                                account,
                                session.reserved_points,
                                order.id,
                                Some("points applied at checkout"),
                            ) {
                                Ok(entry) => points_spent = entry.points_delta.abs(),
                                // drifted reservation must not sink the whole confirmation
                                Err(ServiceError::Conflict(msg)) => {
                                    error!(order_number = %order.order_number, %msg, "skipping reserved-points spend")
                                }
                                Err(e) => return Err(e),
                            }
                        }
                    } else {
                        warn!(
                            order_number = %order.order_number,
                            "session reserved points but order has no customer, discarding hold"
                        );
                    }
                }
                if !session.is_status(SessionStatus::Paid) {
                    set_session_status(conn, session.id, SessionStatus::Paid)?;
                }
            }
        }

        if let Some(account) = order.customer_id {
            if loyalty::find_order_entry(conn, order.id, LedgerKind::Earn)?.is_none() {
                let points = loyalty::points_for_total(order.total_cents);
                if points > 0 {
                    loyalty::ensure_account(conn, account)?;
                    let note = format!("order {}", order.order_number);
                    let entry =
                        loyalty::record_earn(conn, account, points, order.id, Some(&note), points_validity_days)?;
                    points_earned = entry.points_delta;
                }
            }
        }

        let payment = load_payment(conn, payment_id)?;
        Ok(ConfirmOutcome::Confirmed {
            payment,
            points_earned,
            points_spent,
        })
    })
}

#[derive(Debug)]
pub struct InitPaymentResult {
    pub order: Order,
    pub payment: Payment,
    /// True when an existing PAID/PENDING attempt was returned instead of a
    /// new one being created.
    pub reused: bool,
}

/// Payment initiation. Idempotent per (order, provider): an existing PAID or
/// PENDING attempt is returned as-is unless `force_new` cancels the pending
/// ones first.
pub fn init_payment(
    conn: &mut PgConnection,
    req_order_id: i64,
    req_provider: PaymentProvider,
    force_new: bool,
) -> Result<InitPaymentResult, ServiceError> {
    conn.transaction::<_, ServiceError, _>(|conn| {
        let order = lock_order(conn, req_order_id)?.ok_or(ServiceError::NotFound("order"))?;
        if order.is_status(OrderStatus::Cancelled) {
            return Err(ServiceError::conflict(format!("order {} is cancelled", order.order_number)));
        }
        if order.is_status(OrderStatus::Draft) {
            return Err(ServiceError::conflict(format!(
                "order {} has not been submitted",
                order.order_number
            )));
        }

        let existing = provider_payments(conn, order.id, req_provider)?;
        if let Some(paid) = existing.iter().find(|p| p.is_status(PaymentStatus::Paid)) {
            return Ok(InitPaymentResult {
                payment: paid.clone(),
                order,
                reused: true,
            });
        }
        if order.is_status(OrderStatus::Confirmed) {
            // confirmed through another provider; a fresh attempt here would double-charge
            return Err(ServiceError::conflict(format!(
                "order {} is already confirmed",
                order.order_number
            )));
        }
        if force_new {
            use crate::schema::payments::dsl::*;
            diesel::update(
                payments
                    .filter(order_id.eq(order.id))
                    .filter(provider.eq(req_provider.as_str()))
                    .filter(status.eq(PaymentStatus::Pending.as_str())),
            )
            .set((status.eq(PaymentStatus::Cancelled.as_str()), updated_at.eq(Utc::now())))
            .execute(conn)?;
        } else if let Some(pending) = existing.iter().find(|p| p.is_status(PaymentStatus::Pending)) {
            return Ok(InitPaymentResult {
                payment: pending.clone(),
                order,
                reused: true,
            });
        }

        let now = Utc::now();
        let session_ref = match req_provider {
            PaymentProvider::ExternalGateway => Some(format!(
                "{}:{:012x}",
                order.order_number,
                fastrand::u64(..) & SESSION_REF_MASK
            )),
            PaymentProvider::ManualTransfer => None,
        };
        let record = NewPayment {
            id: idgen::next(),
            order_id: order.id,
            provider: req_provider.as_str().to_string(),
            status: PaymentStatus::Pending.as_str().to_string(),
            amount_cents: order.total_cents,
            currency: order.currency.clone(),
            session_ref,
            external_id: None,
            provider_payload: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        };
        {
            use crate::schema::payments::dsl::*;
            diesel::insert_into(payments).values(&record).execute(conn)?;
        }
        let payment = load_payment(conn, record.id)?;
        Ok(InitPaymentResult {
            payment,
            order,
            reused: false,
        })
    })
}

/// Flips PENDING checkout sessions past their deadline to EXPIRED. The point
/// hold they carried was never a ledger debit, so expiry alone releases it.
pub fn expire_stale_sessions(conn: &mut PgConnection) -> Result<usize, ServiceError> {
    use crate::schema::checkout_sessions::dsl::*;
    let count = diesel::update(
        checkout_sessions
            .filter(status.eq(SessionStatus::Pending.as_str()))
            .filter(expires_at.lt(Utc::now())),
    )
    .set((status.eq(SessionStatus::Expired.as_str()), updated_at.eq(Utc::now())))
    .execute(conn)?;
    Ok(count)
}

pub fn find_stale_order_ids(conn: &mut PgConnection, ttl: Duration) -> Result<Vec<i64>, ServiceError> {
    use crate::schema::orders::dsl::*;
    let cutoff: DateTime<Utc> = Utc::now() - ttl;
    orders
        .filter(status.eq(OrderStatus::Submitted.as_str()))
        .filter(submitted_at.lt(cutoff))
        .select(id)
        .load::<i64>(conn)
        .map_err(Into::into)
}

/// Cancels one stale order, releasing its held seats. Re-checks everything
/// under the order row lock so a concurrently-confirming webhook wins
/// cleanly: if a PAID payment appears, the cancellation is skipped.
pub fn cancel_order_if_unpaid(conn: &mut PgConnection, req_order_id: i64) -> Result<bool, ServiceError> {
    conn.transaction::<_, ServiceError, _>(|conn| {
        let order = match lock_order(conn, req_order_id)? {
            Some(order) => order,
            None => return Ok(false),
        };
        if !order.is_status(OrderStatus::Submitted) {
            return Ok(false);
        }
        let paid_exists = {
            use crate::schema::payments::dsl::*;
            payments
                .filter(order_id.eq(order.id))
                .filter(status.eq(PaymentStatus::Paid.as_str()))
                .select(id)
                .first::<i64>(conn)
                .optional()?
                .is_some()
        };
        if paid_exists {
            // the webhook won the race
            return Ok(false);
        }

        set_order_status(conn, order.id, OrderStatus::Cancelled)?;
        {
            use crate::schema::payments::dsl::*;
            diesel::update(
                payments
                    .filter(order_id.eq(order.id))
                    .filter(status.eq(PaymentStatus::Pending.as_str())),
            )
            .set((status.eq(PaymentStatus::Cancelled.as_str()), updated_at.eq(Utc::now())))
            .execute(conn)?;
        }
        if let Some(trip) = order.trip_id {
            if order.seat_count > 0 {
                capacity::release_seats(conn, trip, order.seat_count)?;
            }
        }
        if let Some(session_id) = order.checkout_session_id {
            if let Some(session) = lock_session(conn, session_id)? {
                if session.is_status(SessionStatus::Pending) {
                    set_session_status(conn, session.id, SessionStatus::Cancelled)?;
                }
            }
        }
        Ok(true)
    })
}
