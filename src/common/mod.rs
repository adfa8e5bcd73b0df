pub mod config;
pub mod errors;

pub use config::{AppConfig, ClientSettings, ConfigOverrides, ServerSettings, TransferSettings};
pub use errors::{AppError, CodecError, SessionError, TransferError};
