use chrono::{DateTime, Utc};
use diesel::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Draft,
    Submitted,
    Confirmed,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Draft => "DRAFT",
            OrderStatus::Submitted => "SUBMITTED",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Cancelled,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::Failed => "FAILED",
            PaymentStatus::Cancelled => "CANCELLED",
            PaymentStatus::Refunded => "REFUNDED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentProvider {
    ExternalGateway,
    ManualTransfer,
}

impl PaymentProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentProvider::ExternalGateway => "EXTERNAL_GATEWAY",
            PaymentProvider::ManualTransfer => "MANUAL_TRANSFER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EXTERNAL_GATEWAY" => Some(PaymentProvider::ExternalGateway),
            "MANUAL_TRANSFER" => Some(PaymentProvider::ManualTransfer),
            _ => None,
        }
    }
}

/// Ledger entry kinds. EARN rows expire, SPEND rows carry a negative delta,
/// ADJUST rows are signed operator corrections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerKind {
    Earn,
    Spend,
    Adjust,
}

impl LedgerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerKind::Earn => "EARN",
            LedgerKind::Spend => "SPEND",
            LedgerKind::Adjust => "ADJUST",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Pending,
    Paid,
    Cancelled,
    Expired,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Pending => "PENDING",
            SessionStatus::Paid => "PAID",
            SessionStatus::Cancelled => "CANCELLED",
            SessionStatus::Expired => "EXPIRED",
        }
    }
}

#[derive(Debug, Clone, Queryable)]
pub struct Order {
    pub id: i64,
    pub order_number: String,
    pub customer_id: Option<i64>,
    pub contact_email: String,
    pub trip_id: Option<i64>,
    pub seat_count: i32,
    pub total_cents: i64,
    pub currency: String,
    pub status: String,
    pub checkout_session_id: Option<i64>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn is_status(&self, status: OrderStatus) -> bool {
        self.status == status.as_str()
    }
}

#[derive(Debug, Clone, Queryable)]
pub struct Payment {
    pub id: i64,
    pub order_id: i64,
    pub provider: String,
    pub status: String,
    pub amount_cents: i64,
    pub currency: String,
    pub session_ref: Option<String>,
    pub external_id: Option<String>,
    pub provider_payload: Option<serde_json::Value>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn is_status(&self, status: PaymentStatus) -> bool {
        self.status == status.as_str()
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::payments)]
pub struct NewPayment {
    pub id: i64,
    pub order_id: i64,
    pub provider: String,
    pub status: String,
    pub amount_cents: i64,
    pub currency: String,
    pub session_ref: Option<String>,
    pub external_id: Option<String>,
    pub provider_payload: Option<serde_json::Value>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
pub struct LoyaltyTransaction {
    pub id: i64,
    pub account_id: i64,
    pub kind: String,
    pub points_delta: i64,
    pub order_id: Option<i64>,
    pub note: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::loyalty_transactions)]
pub struct NewLoyaltyTransaction {
    pub id: i64,
    pub account_id: i64,
    pub kind: String,
    pub points_delta: i64,
    pub order_id: Option<i64>,
    pub note: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable)]
pub struct CheckoutSession {
    pub id: i64,
    pub customer_id: Option<i64>,
    pub status: String,
    pub cart: serde_json::Value,
    pub reserved_points: i64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckoutSession {
    pub fn is_status(&self, status: SessionStatus) -> bool {
        self.status == status.as_str()
    }
}
