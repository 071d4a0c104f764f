//! Error types for the serial link service.
//!
//! None of these ever reach an [`EventListener`](crate::event::EventListener);
//! the manager converts them into lifecycle events or logs and drops them.

use bluer::Address;
use thiserror::Error;

/// Main error type for the serial link service.
#[derive(Error, Debug)]
pub enum LinkError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Adapter not found")]
   AdapterNotFound,

   #[error("Failed to connect to {0}: {1}")]
   ConnectFailed(Address, String),

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("A connection is already active or in progress")]
   Busy,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),
}

/// Convenience type alias for Results with `LinkError`.
pub type Result<T> = std::result::Result<T, LinkError>;
