use diesel::result::Error;
use diesel::{ExpressionMethods, OptionalExtension, PgConnection, QueryDsl, RunQueryDsl};

/// Seats-remaining surface of the catalog store. The counters are only ever
/// mutated inside a transaction that holds the relevant order row lock.

pub fn seats_remaining(conn: &mut PgConnection, req_trip_id: i64) -> Result<Option<i32>, Error> {
    use crate::schema::trips::dsl::*;
    trips
        .filter(id.eq(req_trip_id))
        .select(seats_left)
        .first::<i32>(conn)
        .optional()
}

// guarded decrement, returns false when not enough seats are left
pub fn take_seats(conn: &mut PgConnection, req_trip_id: i64, count: i32) -> Result<bool, Error> {
    use crate::schema::trips::dsl::*;
    diesel::update(trips.filter(id.eq(req_trip_id)).filter(seats_left.ge(count)))
        .set(seats_left.eq(seats_left - count))
        .execute(conn)
        .map(|res| res > 0)
}

pub fn release_seats(conn: &mut PgConnection, req_trip_id: i64, count: i32) -> Result<(), Error> {
    use crate::schema::trips::dsl::*;
    diesel::update(trips.filter(id.eq(req_trip_id)))
        .set(seats_left.eq(seats_left + count))
        .execute(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::testutil;
    use diesel::Connection;

    #[test]
    #[ignore = "requires DATABASE_URL"]
    fn take_is_guarded_release_is_not() {
        dotenvy::dotenv().ok();
        let pool = crate::database::connect::create_db_connection_pool();
        pool.get().unwrap().test_transaction::<_, Error, _>(|conn| {
            let trip = testutil::insert_trip(conn, 10, 3);

            assert!(take_seats(conn, trip, 2)?);
            assert_eq!(seats_remaining(conn, trip)?, Some(1));
            assert!(!take_seats(conn, trip, 2)?);
            assert_eq!(seats_remaining(conn, trip)?, Some(1));

            release_seats(conn, trip, 2)?;
            assert_eq!(seats_remaining(conn, trip)?, Some(3));

            assert_eq!(seats_remaining(conn, 0)?, None);
            Ok(())
        });
    }
}
