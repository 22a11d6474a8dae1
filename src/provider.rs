use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{Map, Value};
use sha2::Sha256;

use crate::config::AppConfig;
use crate::errors::ServiceError;

type HmacSha256 = Hmac<Sha256>;

/// Computes the shared-secret signature over the canonical field ordering
/// used by both the webhook check and the verify request.
pub fn sign_fields(
    secret: &str,
    session_id: &str,
    provider_order_id: &str,
    amount_cents: i64,
    currency: &str,
) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(format!("{session_id}|{provider_order_id}|{amount_cents}|{currency}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// A provider webhook, normalized from either a JSON or a form-encoded body
/// and from the field-name variants the gateway emits across environments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookNotification {
    pub merchant_id: String,
    pub pos_id: String,
    pub session_id: String,
    pub amount_cents: i64,
    pub currency: String,
    pub provider_order_id: String,
    pub signature: String,
}

fn parse_fields(body: &[u8]) -> Result<Map<String, Value>, ServiceError> {
    if let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) {
        return Ok(map);
    }
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_bytes(body).map_err(|_| ServiceError::validation("body"))?;
    Ok(pairs.into_iter().map(|(k, v)| (k, Value::String(v))).collect())
}

// field names arrive bare camelCase, snake_case or with the gateway prefix
fn field<'a>(map: &'a Map<String, Value>, camel: &str, snake: &str) -> Option<&'a Value> {
    map.get(camel)
        .or_else(|| map.get(snake))
        .or_else(|| map.get(&format!("gw_{snake}")))
}

fn string_field(map: &Map<String, Value>, camel: &str, snake: &str) -> Result<String, ServiceError> {
    match field(map, camel, snake) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(ServiceError::validation(camel)),
    }
}

fn amount_field(map: &Map<String, Value>, camel: &str, snake: &str) -> Result<i64, ServiceError> {
    let amount = match field(map, camel, snake) {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    match amount {
        Some(amount) if amount > 0 => Ok(amount),
        _ => Err(ServiceError::validation(camel)),
    }
}

impl WebhookNotification {
    pub fn from_body(body: &[u8]) -> Result<Self, ServiceError> {
        let map = parse_fields(body)?;
        Ok(WebhookNotification {
            merchant_id: string_field(&map, "merchantId", "merchant_id")?,
            pos_id: string_field(&map, "posId", "pos_id")?,
            session_id: string_field(&map, "sessionId", "session_id")?,
            amount_cents: amount_field(&map, "amount", "amount")?,
            currency: string_field(&map, "currency", "currency")?,
            provider_order_id: string_field(&map, "orderId", "order_id")?,
            signature: string_field(&map, "sign", "sign")?,
        })
    }

    /// The logical order number: session ids are issued as
    /// `{order_number}:{attempt_suffix}` so provider-side retries stay
    /// distinct while mapping back to one order.
    pub fn base_order_number(&self) -> &str {
        self.session_id.split(':').next().unwrap_or(&self.session_id)
    }

    pub fn verify_signature(&self, secret: &str) -> bool {
        let expected = sign_fields(
            secret,
            &self.session_id,
            &self.provider_order_id,
            self.amount_cents,
            &self.currency,
        );
        expected.eq_ignore_ascii_case(&self.signature)
    }

    /// Normalized copy of the notification for the payment audit blob.
    pub fn audit_payload(&self) -> Value {
        serde_json::json!({
            "merchantId": self.merchant_id,
            "posId": self.pos_id,
            "sessionId": self.session_id,
            "amount": self.amount_cents,
            "currency": self.currency,
            "orderId": self.provider_order_id,
            "sign": self.signature,
        })
    }
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    status: String,
}

#[derive(Debug, Deserialize)]
struct VerifyResponse {
    data: Option<VerifyData>,
    error: Option<String>,
}

#[derive(Debug)]
pub enum VerifyOutcome {
    Confirmed,
    Rejected(String),
}

/// Client for the gateway REST API. The verify call is the authoritative
/// confirmation; the webhook alone is never trusted.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    http: reqwest::Client,
    api_url: String,
    redirect_base: String,
    merchant_id: String,
    pos_id: String,
    secret: String,
}

impl GatewayClient {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(config.verify_timeout).build()?;
        Ok(GatewayClient {
            http,
            api_url: config.gateway_api_url.trim_end_matches('/').to_string(),
            redirect_base: config.gateway_redirect_url.trim_end_matches('/').to_string(),
            merchant_id: config.gateway_merchant_id.clone(),
            pos_id: config.gateway_pos_id.clone(),
            secret: config.gateway_secret.clone(),
        })
    }

    /// Confirms a webhook's claimed outcome against the provider API.
    /// A timeout or transport fault is an `Infrastructure` error, never a
    /// rejection: marking FAILED on a timeout could contradict a later
    /// successful redelivery.
    pub async fn verify_transaction(&self, note: &WebhookNotification) -> Result<VerifyOutcome, ServiceError> {
        let sign = sign_fields(
            &self.secret,
            &note.session_id,
            &note.provider_order_id,
            note.amount_cents,
            &note.currency,
        );
        let body = serde_json::json!({
            "merchantId": self.merchant_id,
            "posId": self.pos_id,
            "sessionId": note.session_id,
            "amount": note.amount_cents,
            "currency": note.currency,
            "orderId": note.provider_order_id,
            "sign": sign,
        });

        let response = self
            .http
            .post(format!("{}/transaction/verify", self.api_url))
            .json(&body)
            .send()
            .await?;
        let http_status = response.status();
        if http_status.is_server_error() {
            return Err(ServiceError::Infrastructure(anyhow::anyhow!(
                "verify endpoint returned {http_status}"
            )));
        }
        let parsed: VerifyResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Infrastructure(e.into()))?;

        let confirmed = http_status.is_success() && parsed.data.as_ref().map_or(false, |d| d.status == "success");
        if confirmed {
            Ok(VerifyOutcome::Confirmed)
        } else {
            let message = parsed
                .error
                .or(parsed.data.map(|d| d.status))
                .unwrap_or_else(|| format!("verify returned http {http_status}"));
            Ok(VerifyOutcome::Rejected(message))
        }
    }

    /// Checkout URL the customer is redirected to for a gateway payment.
    pub fn redirect_url_for(&self, session_ref: &str, amount_cents: i64, currency: &str) -> String {
        let amount = amount_cents.to_string();
        let sign = sign_fields(&self.secret, session_ref, "", amount_cents, currency);
        let query = serde_urlencoded::to_string([
            ("merchantId", self.merchant_id.as_str()),
            ("posId", self.pos_id.as_str()),
            ("sessionId", session_ref),
            ("amount", amount.as_str()),
            ("currency", currency),
            ("sign", sign.as_str()),
        ])
        .unwrap_or_default();
        format!("{}/checkout?{}", self.redirect_base, query)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "wh_secret_1";

    fn signed_body() -> serde_json::Value {
        let sign = sign_fields(SECRET, "240811:a1b2c3d4e5f6", "GW-77", 50000, "EUR");
        serde_json::json!({
            "merchantId": "m-1",
            "posId": "p-1",
            "sessionId": "240811:a1b2c3d4e5f6",
            "amount": 50000,
            "currency": "EUR",
            "orderId": "GW-77",
            "sign": sign,
        })
    }

    #[test]
    fn parses_camel_case_json() {
        let body = serde_json::to_vec(&signed_body()).unwrap();
        let note = WebhookNotification::from_body(&body).unwrap();
        assert_eq!(note.merchant_id, "m-1");
        assert_eq!(note.amount_cents, 50000);
        assert_eq!(note.provider_order_id, "GW-77");
        assert_eq!(note.base_order_number(), "240811");
        assert!(note.verify_signature(SECRET));
    }

    #[test]
    fn parses_prefixed_form_body() {
        let body = "gw_merchant_id=m-1&gw_pos_id=p-1&gw_session_id=240811%3Aff00ff00ff00\
                    &gw_amount=50000&gw_currency=EUR&gw_order_id=GW-77&gw_sign=feed";
        let note = WebhookNotification::from_body(body.as_bytes()).unwrap();
        assert_eq!(note.pos_id, "p-1");
        assert_eq!(note.session_id, "240811:ff00ff00ff00");
        assert_eq!(note.amount_cents, 50000);
        assert_eq!(note.base_order_number(), "240811");
    }

    #[test]
    fn accepts_snake_case_and_string_amount() {
        let body = serde_json::json!({
            "merchant_id": "m-1",
            "pos_id": "p-1",
            "session_id": "240811:00aa00aa00aa",
            "amount": "50000",
            "currency": "EUR",
            "order_id": "GW-78",
            "sign": "beef",
        });
        let note = WebhookNotification::from_body(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(note.amount_cents, 50000);
    }

    #[test]
    fn missing_field_names_the_field() {
        let mut body = signed_body();
        body.as_object_mut().unwrap().remove("posId");
        let err = WebhookNotification::from_body(&serde_json::to_vec(&body).unwrap()).unwrap_err();
        match err {
            ServiceError::Validation(field) => assert_eq!(field, "posId"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn rejects_non_positive_amount() {
        let mut body = signed_body();
        body["amount"] = serde_json::json!(0);
        assert!(WebhookNotification::from_body(&serde_json::to_vec(&body).unwrap()).is_err());
    }

    #[test]
    fn rejects_garbage_body() {
        // '=' makes it neither JSON nor a parseable form pair list
        let err = WebhookNotification::from_body(b"\x00\xff=\x00&&=").unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[test]
    fn tampered_amount_fails_signature() {
        let mut body = signed_body();
        body["amount"] = serde_json::json!(40000);
        let note = WebhookNotification::from_body(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert!(!note.verify_signature(SECRET));
    }

    #[test]
    fn wrong_secret_fails_signature() {
        let body = serde_json::to_vec(&signed_body()).unwrap();
        let note = WebhookNotification::from_body(&body).unwrap();
        assert!(!note.verify_signature("other_secret"));
    }

    #[test]
    fn signature_is_deterministic_hex() {
        let a = sign_fields(SECRET, "s", "o", 1, "EUR");
        let b = sign_fields(SECRET, "s", "o", 1, "EUR");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn session_without_suffix_maps_to_itself() {
        let mut body = signed_body();
        body["sessionId"] = serde_json::json!("240811");
        let note = WebhookNotification::from_body(&serde_json::to_vec(&body).unwrap()).unwrap();
        assert_eq!(note.base_order_number(), "240811");
    }
}
