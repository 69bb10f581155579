pub mod commands;
pub mod common;
pub mod events;
pub mod output;
pub mod report;
pub mod server;
pub mod transfer;
pub mod transport;
