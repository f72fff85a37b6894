//! Typed events produced by the QC35 session.
//!
//! Every decoded acknowledgement frame, connection state change, and
//! reported anomaly surfaces here; the presentation layer consumes these
//! in frame-decode order from the session's event stream.

use smol_str::SmolStr;

use crate::qc35::protocol::{ButtonMode, NoiseLevel};

/// Events emitted by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
   /// The link went down; payload carries a diagnostic when one is known.
   Disconnected(Option<SmolStr>),
   /// A connection attempt is in progress.
   Connecting,
   /// The connect acknowledgement arrived; payload is the firmware version.
   Connected(SmolStr),
   NoiseLevel(NoiseLevel),
   DeviceName(SmolStr),
   /// Auto-off period in minutes, as reported on the wire.
   AutoOffPeriod(u8),
   /// Battery charge percentage.
   BatteryLevel(u8),
   ButtonMode(ButtonMode),
   /// An acknowledgement we recognize but carry no state for, or a decode
   /// anomaly with its diagnostic text.
   Unknown(Option<SmolStr>),
}
