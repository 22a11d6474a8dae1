use snowflake::SnowflakeIdGenerator;
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};

// service launch date, keeps ids short
const SNOWFLAKE_EPOCH: u64 = 1754265600000;

static GENERATOR: once_cell::sync::Lazy<Mutex<SnowflakeIdGenerator>> = once_cell::sync::Lazy::new(|| {
    let epoch = UNIX_EPOCH + Duration::from_millis(SNOWFLAKE_EPOCH);
    let machine_id = fastrand::i32(0..32);
    let node_id = fastrand::i32(0..32);
    Mutex::new(SnowflakeIdGenerator::with_epoch(machine_id, node_id, epoch))
});

pub fn next() -> i64 {
    GENERATOR.lock().unwrap().generate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_positive_and_unique() {
        let mut prev = 0;
        for _ in 0..10000 {
            let id = next();
            assert!(id > 0);
            assert_ne!(id, prev);
            prev = id;
        }
    }
}
