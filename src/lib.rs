pub mod auth;
pub mod clock;
pub mod config;
pub mod ledger;
pub mod limits;
pub mod model;
pub mod observability;
pub mod schedule;
pub mod service;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
