pub mod ble;
pub mod bridge;
pub mod central_client;
pub mod config;
pub mod error;
pub mod store;
