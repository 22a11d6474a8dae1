use actix_web::web;
use tracing::{error, info};

use crate::config::AppConfig;
use crate::database::connect::DbPool;
use crate::database::{loyalty, mutations};
use crate::errors::ServiceError;

#[derive(Debug, Default)]
pub struct SweepStats {
    pub sessions_expired: usize,
    pub orders_cancelled: usize,
    pub balances_resynced: usize,
}

impl SweepStats {
    fn any(&self) -> bool {
        self.sessions_expired > 0 || self.orders_cancelled > 0 || self.balances_resynced > 0
    }
}

/// Spawns the background sweeper next to the HTTP server. Each pass expires
/// stale checkout sessions, cancels unpaid orders past the reservation TTL
/// and audits the cached loyalty balances.
pub fn spawn(db: DbPool, config: AppConfig) {
    let ttl = chrono::Duration::from_std(config.reservation_ttl).unwrap_or_else(|_| chrono::Duration::minutes(120));
    let period = config.sweep_interval;
    actix_web::rt::spawn(async move {
        let mut ticker = actix_web::rt::time::interval(period);
        loop {
            ticker.tick().await;
            let db = db.clone();
            match web::block(move || run_sweep(&db, ttl)).await {
                Ok(Ok(stats)) => {
                    if stats.any() {
                        info!(
                            sessions_expired = stats.sessions_expired,
                            orders_cancelled = stats.orders_cancelled,
                            balances_resynced = stats.balances_resynced,
                            "sweep finished"
                        );
                    }
                }
                Ok(Err(e)) => error!("sweep failed: {e}"),
                Err(e) => error!("sweep task failed: {e}"),
            }
        }
    });
}

pub fn run_sweep(db: &DbPool, ttl: chrono::Duration) -> Result<SweepStats, ServiceError> {
    let mut conn = db.get().map_err(|e| ServiceError::Infrastructure(e.into()))?;
    let conn = &mut *conn;

    let sessions_expired = mutations::expire_stale_sessions(conn)?;

    // each cancellation re-checks for a PAID payment under its own order
    // row lock, so a concurrently-confirming webhook wins the race
    let mut orders_cancelled = 0;
    for order_id in mutations::find_stale_order_ids(conn, ttl)? {
        if mutations::cancel_order_if_unpaid(conn, order_id)? {
            orders_cancelled += 1;
        }
    }

    let balances_resynced = loyalty::audit_cached_balances(conn)?;

    Ok(SweepStats {
        sessions_expired,
        orders_cancelled,
        balances_resynced,
    })
}
