pub mod client;
pub mod common;
pub mod output;
pub mod server;
pub mod session;
pub mod transfer;
pub mod utils;
