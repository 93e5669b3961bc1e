pub mod cli;
pub mod client;
pub mod config;
pub mod heartbeat;
pub mod protocol;
pub mod server;

pub use client::{Client, ExitError};
