use diesel::result::Error;
use diesel::{Connection, ExpressionMethods, OptionalExtension, PgConnection, QueryDsl, RunQueryDsl};

use crate::database::models::{Order, Payment, SessionStatus};
use crate::database::loyalty;

pub fn find_order_by_number(conn: &mut PgConnection, req_order_number: &str) -> Result<Option<Order>, Error> {
    use crate::schema::orders::dsl::*;
    orders
        .filter(order_number.eq(req_order_number))
        .first::<Order>(conn)
        .optional()
}

pub fn load_order_payments(conn: &mut PgConnection, req_order_id: i64) -> Result<Vec<Payment>, Error> {
    use crate::schema::payments::dsl::*;
    payments
        .filter(order_id.eq(req_order_id))
        .order(created_at.desc())
        .load::<Payment>(conn)
}

#[derive(PartialEq, Debug)]
pub enum CustomerPoints {
    Ok(CustomerPointsValues),
    NotFound,
}

#[derive(PartialEq, Debug)]
pub struct CustomerPointsValues {
    pub available: i64,
    pub reserved: i64,
    pub cached_balance: i64,
}

/// Loads a customer's points. The available figure is recomputed from the
/// ledger, minus the holds of still-pending checkout sessions; those holds
/// are display-level only, never a ledger debit. The cached balance is
/// reported alongside for observability.
pub fn load_points(conn: &mut PgConnection, req_customer_id: i64) -> Result<CustomerPoints, Error> {
    conn.transaction::<_, Error, _>(|conn| {
        let cached = {
            use crate::schema::loyalty_accounts::dsl::*;
            loyalty_accounts
                .filter(customer_id.eq(req_customer_id))
                .select(points_balance)
                .first::<i64>(conn)
                .optional()
        };
        let cached = match cached {
            Ok(Some(cached)) => cached,
            Ok(None) => return Ok(CustomerPoints::NotFound),
            Err(e) => return Err(e),
        };
        let reserved: i64 = {
            use crate::schema::checkout_sessions::dsl::*;
            checkout_sessions
                .filter(customer_id.eq(req_customer_id))
                .filter(status.eq(SessionStatus::Pending.as_str()))
                .select(reserved_points)
                .load::<i64>(conn)?
                .into_iter()
                .sum()
        };
        let available = loyalty::available_points(conn, req_customer_id)?;
        Ok(CustomerPoints::Ok(CustomerPointsValues {
            available: (available - reserved).max(0),
            reserved,
            cached_balance: cached,
        }))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testutil::{self, OrderFixture};
    use crate::database::idgen;
    use crate::errors::ServiceError;

    #[test]
    #[ignore = "requires DATABASE_URL"]
    fn pending_session_hold_reduces_displayed_points() {
        dotenvy::dotenv().ok();
        let pool = crate::database::connect::create_db_connection_pool();
        pool.get().unwrap().test_transaction::<_, ServiceError, _>(|conn| {
            let customer = idgen::next();
            loyalty::ensure_account(conn, customer)?;
            loyalty::record_adjust(conn, customer, 300, None)?;
            testutil::insert_session(conn, Some(customer), 120, 30);

            let points = load_points(conn, customer)?;
            assert_eq!(
                points,
                CustomerPoints::Ok(CustomerPointsValues {
                    available: 180,
                    reserved: 120,
                    cached_balance: 300,
                })
            );

            assert_eq!(load_points(conn, idgen::next())?, CustomerPoints::NotFound);
            Ok(())
        });
    }

    #[test]
    #[ignore = "requires DATABASE_URL"]
    fn order_lookup_is_by_exact_number() {
        dotenvy::dotenv().ok();
        let pool = crate::database::connect::create_db_connection_pool();
        pool.get().unwrap().test_transaction::<_, ServiceError, _>(|conn| {
            let order = testutil::insert_order(conn, OrderFixture::default());
            let found = find_order_by_number(conn, &order.order_number)?;
            assert_eq!(found.map(|o| o.id), Some(order.id));
            assert!(find_order_by_number(conn, "no-such-order")?.is_none());
            Ok(())
        });
    }
}
