use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

/// Outbound mail collaborator. Delivery failures are swallowed by the
/// `spawn_*` helpers; nothing in the payment flow waits on email.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_payment_confirmation(
        &self,
        to: &str,
        order_number: &str,
        total_cents: i64,
        currency: &str,
        points_earned: i64,
    ) -> anyhow::Result<()>;

    async fn send_payment_instructions(
        &self,
        to: &str,
        order_number: &str,
        total_cents: i64,
        currency: &str,
        bank_details: &str,
    ) -> anyhow::Result<()>;
}

/// Log-only mailer; the real delivery channel sits behind a separate service.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_payment_confirmation(
        &self,
        to: &str,
        order_number: &str,
        total_cents: i64,
        currency: &str,
        points_earned: i64,
    ) -> anyhow::Result<()> {
        info!(to, order_number, total_cents, currency, points_earned, "payment confirmation email");
        Ok(())
    }

    async fn send_payment_instructions(
        &self,
        to: &str,
        order_number: &str,
        total_cents: i64,
        currency: &str,
        bank_details: &str,
    ) -> anyhow::Result<()> {
        info!(to, order_number, total_cents, currency, bank_details, "payment instructions email");
        Ok(())
    }
}

pub fn spawn_confirmation(
    mailer: Arc<dyn Mailer>,
    to: String,
    order_number: String,
    total_cents: i64,
    currency: String,
    points_earned: i64,
) {
    actix_web::rt::spawn(async move {
        if let Err(e) = mailer
            .send_payment_confirmation(&to, &order_number, total_cents, &currency, points_earned)
            .await
        {
            warn!(%order_number, "payment confirmation email failed: {e}");
        }
    });
}

pub fn spawn_instructions(
    mailer: Arc<dyn Mailer>,
    to: String,
    order_number: String,
    total_cents: i64,
    currency: String,
    bank_details: String,
) {
    actix_web::rt::spawn(async move {
        if let Err(e) = mailer
            .send_payment_instructions(&to, &order_number, total_cents, &currency, &bank_details)
            .await
        {
            warn!(%order_number, "payment instructions email failed: {e}");
        }
    });
}
