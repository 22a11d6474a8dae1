use actix_web::HttpResponse;
use serde_json::json;

use crate::database::models::Payment;

pub fn ok_http_response() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

pub fn bad_parameter_http_response(field: &str) -> HttpResponse {
    HttpResponse::BadRequest().json(json!({
        "status": "error",
        "error": { "kind": "bad_parameter", "field": field },
    }))
}

pub fn not_found_http_response(what: &str) -> HttpResponse {
    HttpResponse::NotFound().json(json!({
        "status": "error",
        "error": { "kind": "not_found", "entity": what },
    }))
}

pub fn conflict_http_response(message: &str) -> HttpResponse {
    HttpResponse::Conflict().json(json!({
        "status": "error",
        "error": { "kind": "conflict", "message": message },
    }))
}

// ids travel as strings, i64 does not survive JS number precision
pub fn payment_http_response(payment: &Payment, redirect_url: Option<String>, instructions_sent: bool) -> HttpResponse {
    let mut body = json!({
        "status": "ok",
        "payment": {
            "id": payment.id.to_string(),
            "orderId": payment.order_id.to_string(),
            "provider": payment.provider,
            "status": payment.status,
            "amountCents": payment.amount_cents,
            "currency": payment.currency,
        },
    });
    if let Some(url) = redirect_url {
        body["payment"]["redirectUrl"] = json!(url);
    }
    if instructions_sent {
        body["payment"]["instructionsSent"] = json!(true);
    }
    HttpResponse::Ok().json(body)
}

pub fn points_http_response(customer_id: i64, available: i64, reserved: i64, cached_balance: i64) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "ok",
        "customerId": customer_id.to_string(),
        "availablePoints": available,
        "reservedPoints": reserved,
        "cachedBalance": cached_balance,
    }))
}
