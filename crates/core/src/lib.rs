pub mod config;
pub mod error;
pub mod message;
pub mod paths;
pub mod types;

pub use config::Config;
pub use error::{Error, Result, StoreError};
pub use message::{OutboundKind, OutboundMessage};
pub use paths::Paths;
