//! Bluetooth communication layer for the QC35.
//!
//! This module provides the RFCOMM socket plumbing the session's I/O
//! workers run on.

pub mod rfcomm;
