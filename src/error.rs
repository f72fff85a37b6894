//! Error types for the QC35 control service.
//!
//! Protocol decode anomalies are deliberately not here: they surface as
//! diagnostic events on the inbound queue (see `qc35::parser::ProtoError`)
//! and never cross a worker boundary as a fault.

use thiserror::Error;

/// Main error type for the QC35 control service.
#[derive(Error, Debug)]
pub enum Qc35Error {
   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Session has been shut down")]
   SessionShutdown,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Invalid device address: {0}")]
   InvalidAddress(String),
}

/// Convenience type alias for Results with `Qc35Error`.
pub type Result<T> = std::result::Result<T, Qc35Error>;
