//! Frame matching and decoding for the QC35 acknowledgement stream.
//!
//! The headphones send variable-length, sometimes misaligned frames on the
//! RFCOMM byte stream. `match_prefix` finds the first catalog pattern at
//! the start of a buffer, `decode` extracts a typed event and the frame's
//! total consumed length, and `drain` walks one read's worth of bytes,
//! skipping unrecognized leading bytes one at a time.

use log::{debug, warn};
use smol_str::{SmolStr, ToSmolStr};
use thiserror::Error;

use crate::{
   event::Event,
   qc35::protocol::{ACK_CATALOG, AckKind, AckPattern, ButtonMode, NoiseLevel},
};

/// Error type for frame decoding anomalies.
///
/// None of these are fatal: the driver converts them to `Event::Unknown`
/// diagnostics and keeps going.
#[derive(Error, Debug)]
pub enum ProtoError {
   /// Frame claims more bytes than the buffer currently holds, e.g. a read
   /// that ended mid-frame.
   #[error("Truncated {kind} frame: expected {expected} bytes, got {actual}")]
   Truncated {
      kind: AckKind,
      expected: usize,
      actual: usize,
   },

   /// Name frame with a declared length of zero.
   #[error("Invalid name length: {declared}")]
   InvalidNameLength { declared: u8 },

   #[error("Unknown noise level code: 0x{code:02x}")]
   UnknownNoiseLevel { code: u8 },

   #[error("Unknown button mode code: 0x{code:02x}")]
   UnknownButtonMode { code: u8 },
}

/// Finds the first acknowledgement pattern matching the start of `buf`.
///
/// Patterns are checked in catalog declaration order; only patterns no
/// longer than the buffer are eligible. Returns `None` when the leading
/// byte is protocol noise.
pub fn match_prefix(buf: &[u8]) -> Option<&'static AckPattern> {
   ACK_CATALOG.iter().find(|pattern| pattern.matches_prefix(buf))
}

/// Decodes each byte as a Latin-1 code point.
///
/// Non-ASCII accessory text is out of scope; bytes above 0x7F map to their
/// Latin-1 equivalents rather than failing.
pub fn decode_ascii(bytes: &[u8]) -> SmolStr {
   bytes.iter().map(|&b| char::from(b)).collect()
}

/// Decodes one matched frame into an event plus its consumed byte count.
///
/// Decode anomalies become `Event::Unknown` diagnostics. A truncated frame
/// consumes the remaining buffer (the tail is unusable); other anomalies
/// consume the pattern length, so the caller always makes progress.
pub fn decode(pattern: &AckPattern, buf: &[u8]) -> (Event, usize) {
   debug_assert!(pattern.matches_prefix(buf));
   match decode_frame(pattern, buf) {
      Ok(out) => out,
      Err(e) => {
         warn!("Decode failure for {} frame: {e}", pattern.kind);
         let consumed = match e {
            ProtoError::Truncated { .. } => buf.len(),
            _ => pattern.len(),
         };
         (Event::Unknown(Some(e.to_smolstr())), consumed)
      },
   }
}

fn decode_frame(pattern: &AckPattern, buf: &[u8]) -> Result<(Event, usize), ProtoError> {
   let header = pattern.len();
   match pattern.kind {
      AckKind::Connect => {
         let firmware = field(buf, header, 5, pattern.kind)?;
         Ok((Event::Connected(decode_ascii(firmware)), header + 5))
      },
      AckKind::Ack1 => Ok((Event::Unknown(Some(SmolStr::new_static("ACK1"))), header)),
      AckKind::Ack2 => Ok((Event::Unknown(Some(SmolStr::new_static("ACK2"))), header)),
      AckKind::Name => {
         // Header byte 3 declares the field size plus one.
         let declared = buf[3];
         let len = declared
            .checked_sub(1)
            .ok_or(ProtoError::InvalidNameLength { declared })? as usize;
         let name = field(buf, header, len, pattern.kind)?;
         Ok((Event::DeviceName(decode_ascii(name)), header + len))
      },
      AckKind::AutoOff => Ok((Event::AutoOffPeriod(buf[4]), header)),
      AckKind::NoiseLevel => {
         let code = buf[4];
         let level =
            NoiseLevel::from_repr(code).ok_or(ProtoError::UnknownNoiseLevel { code })?;
         Ok((Event::NoiseLevel(level), header))
      },
      AckKind::Language => {
         let text = format!("Got some language {}", buf[4]);
         Ok((Event::Unknown(Some(text.into())), header))
      },
      AckKind::Battery => {
         let percent = field(buf, header, 1, pattern.kind)?;
         Ok((Event::BatteryLevel(percent[0]), header + 1))
      },
      AckKind::ButtonAction => {
         let code = buf[6];
         let mode =
            ButtonMode::from_repr(code).ok_or(ProtoError::UnknownButtonMode { code })?;
         Ok((Event::ButtonMode(mode), header))
      },
      AckKind::Unknown => Ok((Event::Unknown(None), header)),
   }
}

fn field(buf: &[u8], at: usize, len: usize, kind: AckKind) -> Result<&[u8], ProtoError> {
   buf.get(at..at + len).ok_or(ProtoError::Truncated {
      kind,
      expected: at + len,
      actual: buf.len(),
   })
}

/// Segments one read's worth of bytes into events.
///
/// Unmatched leading bytes are dropped one at a time; matched frames
/// advance by their consumed length. Both branches strictly shrink the
/// buffer, so the loop always terminates.
pub fn drain(buf: &[u8]) -> Vec<Event> {
   let mut events = Vec::new();
   let mut rest = buf;
   while !rest.is_empty() {
      let Some(pattern) = match_prefix(rest) else {
         debug!("Unmatched byte 0x{:02x}, skipping", rest[0]);
         rest = &rest[1..];
         continue;
      };
      let (event, consumed) = decode(pattern, rest);
      debug_assert!(consumed >= 1 && consumed <= rest.len());
      events.push(event);
      rest = &rest[consumed.min(rest.len())..];
   }
   events
}
