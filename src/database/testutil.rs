//! Row fixtures for the live-database tests.

use chrono::{DateTime, Duration, Utc};
use diesel::prelude::*;

use crate::database::idgen;
use crate::database::models::{CheckoutSession, Order, OrderStatus, SessionStatus};

#[derive(Insertable)]
#[diesel(table_name = crate::schema::trips)]
struct NewTrip {
    id: i64,
    name: String,
    departs_at: DateTime<Utc>,
    seats_total: i32,
    seats_left: i32,
    price_cents: i64,
    currency: String,
    created_at: DateTime<Utc>,
}

pub fn insert_trip(conn: &mut PgConnection, total: i32, left: i32) -> i64 {
    let rec = NewTrip {
        id: idgen::next(),
        name: "Harbor loop".to_string(),
        departs_at: Utc::now() + Duration::days(7),
        seats_total: total,
        seats_left: left,
        price_cents: 50000,
        currency: "EUR".to_string(),
        created_at: Utc::now(),
    };
    use crate::schema::trips::dsl::*;
    diesel::insert_into(trips).values(&rec).execute(conn).unwrap();
    rec.id
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::checkout_sessions)]
struct NewCheckoutSession {
    id: i64,
    customer_id: Option<i64>,
    status: String,
    cart: serde_json::Value,
    reserved_points: i64,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

pub fn insert_session(
    conn: &mut PgConnection,
    customer: Option<i64>,
    reserved: i64,
    expires_in_minutes: i64,
) -> CheckoutSession {
    let now = Utc::now();
    let rec = NewCheckoutSession {
        id: idgen::next(),
        customer_id: customer,
        status: SessionStatus::Pending.as_str().to_string(),
        cart: serde_json::json!({}),
        reserved_points: reserved,
        expires_at: now + Duration::minutes(expires_in_minutes),
        created_at: now,
        updated_at: now,
    };
    use crate::schema::checkout_sessions::dsl::*;
    diesel::insert_into(checkout_sessions).values(&rec).execute(conn).unwrap();
    checkout_sessions.filter(id.eq(rec.id)).first(conn).unwrap()
}

#[derive(Insertable)]
#[diesel(table_name = crate::schema::orders)]
struct NewOrder {
    id: i64,
    order_number: String,
    customer_id: Option<i64>,
    contact_email: String,
    trip_id: Option<i64>,
    seat_count: i32,
    total_cents: i64,
    currency: String,
    status: String,
    checkout_session_id: Option<i64>,
    submitted_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

pub struct OrderFixture {
    pub customer_id: Option<i64>,
    pub trip_id: Option<i64>,
    pub seat_count: i32,
    pub total_cents: i64,
    pub currency: String,
    pub status: OrderStatus,
    pub submitted_minutes_ago: i64,
    pub checkout_session_id: Option<i64>,
}

impl Default for OrderFixture {
    fn default() -> Self {
        OrderFixture {
            customer_id: Some(7001),
            trip_id: None,
            seat_count: 0,
            total_cents: 50000,
            currency: "EUR".to_string(),
            status: OrderStatus::Submitted,
            submitted_minutes_ago: 5,
            checkout_session_id: None,
        }
    }
}

pub fn insert_order(conn: &mut PgConnection, fixture: OrderFixture) -> Order {
    let now = Utc::now();
    let order_id = idgen::next();
    let rec = NewOrder {
        id: order_id,
        order_number: order_id.to_string(),
        customer_id: fixture.customer_id,
        contact_email: "traveller@example.com".to_string(),
        trip_id: fixture.trip_id,
        seat_count: fixture.seat_count,
        total_cents: fixture.total_cents,
        currency: fixture.currency,
        status: fixture.status.as_str().to_string(),
        checkout_session_id: fixture.checkout_session_id,
        submitted_at: Some(now - Duration::minutes(fixture.submitted_minutes_ago)),
        created_at: now,
        updated_at: now,
    };
    use crate::schema::orders::dsl::*;
    diesel::insert_into(orders).values(&rec).execute(conn).unwrap();
    orders.filter(id.eq(rec.id)).first(conn).unwrap()
}
