pub mod capacity;
pub mod connect;
pub mod idgen;
pub mod loyalty;
pub mod models;
pub mod mutations;
pub mod queries;

#[cfg(test)]
pub mod testutil;
