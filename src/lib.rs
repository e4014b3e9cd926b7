pub mod commands;
pub mod config;
pub mod connection;
pub mod handlers;
pub mod logging;
pub mod mail;
pub mod message;
pub mod order_types;
pub mod poller;
pub mod reconnect;
pub mod report;
pub mod routes;
pub mod security_types;
pub mod session;
