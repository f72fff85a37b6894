//! Bose QC35 protocol support.
//!
//! Submodules cover the static command/acknowledgement catalog, frame
//! matching and decoding, and the connection session with its I/O workers.

pub mod parser;
pub mod protocol;
pub mod session;
