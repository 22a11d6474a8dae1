use std::ops::DerefMut;
use std::sync::Arc;

use actix_request_identifier::RequestId;
use actix_web::{get, post, web, HttpResponse};
use serde::Deserialize;
use tracing::{error, info, instrument, warn};

use crate::config::AppConfig;
use crate::database::connect::DbPool;
use crate::database::models::{PaymentProvider, PaymentStatus};
use crate::database::mutations::ConfirmOutcome;
use crate::database::{mutations, queries};
use crate::errors::ServiceError;
use crate::mailer::{self, Mailer};
use crate::provider::{GatewayClient, VerifyOutcome, WebhookNotification};
use crate::responses;

/// Gateway webhook. Every definitively-resolved outcome (paid, rejected,
/// amount mismatch, redelivery) is acknowledged with 200 so the provider
/// stops retrying; only infrastructure faults bubble into a 5xx.
#[post("/payments/webhook")]
#[instrument(skip(db, gateway, mailer, config, body), fields(request_id = request_id.as_str()))]
pub async fn webhook_handler(
    db: web::Data<DbPool>,
    gateway: web::Data<GatewayClient>,
    mailer: web::Data<Arc<dyn Mailer>>,
    config: web::Data<AppConfig>,
    request_id: RequestId,
    body: web::Bytes,
) -> Result<HttpResponse, Box<dyn std::error::Error>> {
    let note = match WebhookNotification::from_body(&body) {
        Ok(note) => note,
        Err(ServiceError::Validation(field)) => return Ok(responses::bad_parameter_http_response(&field)),
        Err(e) => return Err(e.into()),
    };

    let mut conn = db.get()?;
    let base = note.base_order_number().to_string();
    let order = web::block(move || {
        queries::find_order_by_number(conn.deref_mut(), base.as_str()).map_err(anyhow::Error::from)
    })
    .await
    .unwrap_or_else(|e| {
        error!("{e}");
        Err(e.into())
    })?;
    let order = match order {
        Some(order) => order,
        None => {
            warn!(session_id = %note.session_id, "webhook for unknown order");
            return Ok(responses::not_found_http_response("order"));
        }
    };

    // advisory only: the remote verify below is the authoritative check
    if !note.verify_signature(&config.gateway_secret) {
        warn!(session_id = %note.session_id, "webhook signature mismatch, deferring to remote verify");
    }

    let verdict = gateway.verify_transaction(&note).await?;

    let failure_reason = match &verdict {
        VerifyOutcome::Rejected(message) => Some(format!("provider rejected transaction: {message}")),
        VerifyOutcome::Confirmed if note.amount_cents != order.total_cents || note.currency != order.currency => {
            error!(
                order_number = %order.order_number,
                claimed = note.amount_cents,
                expected = order.total_cents,
                "webhook amount mismatch"
            );
            Some(format!(
                "amount mismatch: webhook reported {} {}, order total is {} {}",
                note.amount_cents, note.currency, order.total_cents, order.currency
            ))
        }
        VerifyOutcome::Confirmed => None,
    };

    let payload = note.audit_payload();
    let req_provider = PaymentProvider::ExternalGateway;
    let mut conn = db.get()?;

    if let Some(reason) = failure_reason {
        let req_order_id = order.id;
        let res = web::block(move || {
            mutations::mark_payment_failed(
                conn.deref_mut(),
                req_order_id,
                req_provider,
                note.amount_cents,
                &note.currency,
                &payload,
                &reason,
            )
        })
        .await;
        return match res {
            Ok(Ok(_)) => Ok(responses::ok_http_response()),
            Ok(Err(ServiceError::NotFound(what))) => Ok(responses::not_found_http_response(what)),
            Ok(Err(e)) => {
                error!("{e}");
                Err(e.into())
            }
            Err(e) => {
                error!("{e}");
                Err(e.into())
            }
        };
    }

    let req_order_id = order.id;
    let validity_days = config.points_validity_days;
    let res = web::block(move || {
        mutations::confirm_payment(
            conn.deref_mut(),
            req_order_id,
            req_provider,
            &note.provider_order_id,
            &payload,
            validity_days,
        )
    })
    .await;
    let outcome = match res {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            error!("{e}");
            return Err(e.into());
        }
        Err(e) => {
            error!("{e}");
            return Err(e.into());
        }
    };

    match outcome {
        ConfirmOutcome::Confirmed {
            payment,
            points_earned,
            points_spent,
        } => {
            info!(
                order_number = %order.order_number,
                payment_id = payment.id,
                points_earned,
                points_spent,
                "payment confirmed"
            );
            mailer::spawn_confirmation(
                mailer.get_ref().clone(),
                order.contact_email.clone(),
                order.order_number.clone(),
                order.total_cents,
                order.currency.clone(),
                points_earned,
            );
            Ok(responses::ok_http_response())
        }
        ConfirmOutcome::AlreadyPaid(_) => Ok(responses::ok_http_response()),
        ConfirmOutcome::OrderCancelled(_) => Ok(responses::ok_http_response()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInitInput {
    pub provider: String,
    #[serde(default)]
    pub force_new: bool,
}

#[post("/orders/{order_id}/payments")]
#[instrument(skip(db, gateway, mailer, config, input), fields(request_id = request_id.as_str()))]
pub async fn payment_init_handler(
    db: web::Data<DbPool>,
    gateway: web::Data<GatewayClient>,
    mailer: web::Data<Arc<dyn Mailer>>,
    config: web::Data<AppConfig>,
    request_id: RequestId,
    order_id: web::Path<i64>,
    input: web::Json<PaymentInitInput>,
) -> Result<HttpResponse, Box<dyn std::error::Error>> {
    let req_provider = match PaymentProvider::parse(&input.provider) {
        Some(p) => p,
        None => return Ok(responses::bad_parameter_http_response("provider")),
    };

    let mut conn = db.get()?;
    let req_order_id = order_id.into_inner();
    let force_new = input.force_new;
    let res = web::block(move || mutations::init_payment(conn.deref_mut(), req_order_id, req_provider, force_new)).await;
    let init = match res {
        Ok(Ok(init)) => init,
        Ok(Err(ServiceError::NotFound(what))) => return Ok(responses::not_found_http_response(what)),
        Ok(Err(ServiceError::Conflict(message))) => return Ok(responses::conflict_http_response(&message)),
        Ok(Err(ServiceError::Validation(field))) => return Ok(responses::bad_parameter_http_response(&field)),
        Ok(Err(e)) => {
            error!("{e}");
            return Err(e.into());
        }
        Err(e) => {
            error!("{e}");
            return Err(e.into());
        }
    };

    let redirect_url = match req_provider {
        PaymentProvider::ExternalGateway if init.payment.is_status(PaymentStatus::Pending) => init
            .payment
            .session_ref
            .as_deref()
            .map(|s| gateway.redirect_url_for(s, init.payment.amount_cents, &init.payment.currency)),
        _ => None,
    };

    let instructions_sent = req_provider == PaymentProvider::ManualTransfer
        && !init.reused
        && init.payment.is_status(PaymentStatus::Pending);
    if instructions_sent {
        mailer::spawn_instructions(
            mailer.get_ref().clone(),
            init.order.contact_email.clone(),
            init.order.order_number.clone(),
            init.order.total_cents,
            init.order.currency.clone(),
            config.bank_details.clone(),
        );
    }

    Ok(responses::payment_http_response(&init.payment, redirect_url, instructions_sent))
}

#[get("/customers/{customer_id}/points")]
#[instrument(skip(db), fields(request_id = request_id.as_str()))]
pub async fn points_handler(
    db: web::Data<DbPool>,
    request_id: RequestId,
    customer_id: web::Path<i64>,
) -> Result<HttpResponse, Box<dyn std::error::Error>> {
    let mut conn = db.get()?;
    let req_customer_id = customer_id.into_inner();
    web::block(move || queries::load_points(conn.deref_mut(), req_customer_id).map_err(anyhow::Error::from))
        .await
        .unwrap_or_else(|e| {
            error!("{e}");
            Err(e.into())
        })
        .map(|points| match points {
            queries::CustomerPoints::Ok(values) => {
                responses::points_http_response(req_customer_id, values.available, values.reserved, values.cached_balance)
            }
            queries::CustomerPoints::NotFound => responses::not_found_http_response("customer"),
        })
        .map_err(Into::into)
}
