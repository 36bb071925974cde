pub mod cancel;
pub mod client;
pub mod clock;
pub mod config;
pub mod connection_pool;
pub mod errors;
pub mod hub;
pub mod metrics;
pub mod payload;
pub mod proxy;
pub mod server;
pub mod session;
pub mod trace;
pub mod utils;
pub mod worker;
