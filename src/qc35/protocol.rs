//! QC35 protocol definitions and data structures.
//!
//! This module contains the protocol-specific constants for communicating
//! with Bose QC35 headphones over RFCOMM: the catalog of outbound command
//! byte sequences and the priority-ordered catalog of inbound
//! acknowledgement patterns. Pure data, no side effects.

/// Noise cancellation levels supported by the QC35.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display, strum::EnumString)]
#[repr(u8)]
pub enum NoiseLevel {
   #[strum(serialize = "low")]
   Low = 0x03,
   #[strum(serialize = "high")]
   High = 0x01,
   #[strum(serialize = "off")]
   Off = 0x00,
}

/// Action-button assignments reported by the headphones.
///
/// `Error` (0x7F) is a wire value the accessory itself reports; it is never
/// sent as part of a button-mode set command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display, strum::EnumString)]
#[repr(u8)]
pub enum ButtonMode {
   #[strum(serialize = "alexa")]
   Alexa = 0x01,
   #[strum(serialize = "nc", serialize = "noise_control")]
   NoiseControl = 0x02,
   #[strum(serialize = "error")]
   Error = 0x7F,
}

/// Auto-off timer periods accepted by the QC35, in minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display, strum::EnumString)]
#[repr(u8)]
pub enum AutoOffTimeout {
   #[strum(serialize = "never")]
   Never = 0,
   #[strum(serialize = "20")]
   Min20 = 20,
   #[strum(serialize = "60")]
   Min60 = 60,
   #[strum(serialize = "180")]
   Min180 = 180,
}

/// Outbound instructions understood by the headphones.
///
/// A closed catalog: every command owns a fixed byte sequence ready for
/// transmission, fully defined at build time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum Command {
   #[strum(serialize = "connect")]
   Connect,
   #[strum(serialize = "noise_low")]
   NoiseLevelLow,
   #[strum(serialize = "noise_high")]
   NoiseLevelHigh,
   #[strum(serialize = "noise_off")]
   NoiseLevelOff,
   #[strum(serialize = "auto_off_never")]
   AutoOffNever,
   #[strum(serialize = "auto_off_20")]
   AutoOff20,
   #[strum(serialize = "auto_off_60")]
   AutoOff60,
   #[strum(serialize = "auto_off_180")]
   AutoOff180,
   #[strum(serialize = "get_status")]
   GetDeviceStatus,
   #[strum(serialize = "get_battery")]
   GetBatteryLevel,
   #[strum(serialize = "button_alexa")]
   ButtonModeAlexa,
   #[strum(serialize = "button_nc")]
   ButtonModeNoiseControl,
}

impl Command {
   /// The wire bytes for this command.
   ///
   /// Noise-level and auto-off commands share a 4-byte header and differ
   /// only in the trailing parameter byte.
   pub const fn bytes(self) -> &'static [u8] {
      match self {
         Self::Connect => &[0x00, 0x01, 0x01, 0x00],
         Self::NoiseLevelLow => &[0x01, 0x06, 0x02, 0x01, 0x03],
         Self::NoiseLevelHigh => &[0x01, 0x06, 0x02, 0x01, 0x01],
         Self::NoiseLevelOff => &[0x01, 0x06, 0x02, 0x01, 0x00],
         Self::AutoOffNever => &[0x01, 0x04, 0x02, 0x01, 0x00],
         Self::AutoOff20 => &[0x01, 0x04, 0x02, 0x01, 0x14],
         Self::AutoOff60 => &[0x01, 0x04, 0x02, 0x01, 0x3c],
         Self::AutoOff180 => &[0x01, 0x04, 0x02, 0x01, 0xb4],
         Self::GetDeviceStatus => &[0x01, 0x01, 0x05, 0x00],
         Self::GetBatteryLevel => &[0x02, 0x02, 0x01, 0x00],
         Self::ButtonModeAlexa => &[0x01, 0x09, 0x02, 0x03, 0x10, 0x04, 0x01],
         Self::ButtonModeNoiseControl => &[0x01, 0x09, 0x02, 0x03, 0x10, 0x04, 0x02],
      }
   }

   pub const fn set_noise_level(level: NoiseLevel) -> Self {
      match level {
         NoiseLevel::Low => Self::NoiseLevelLow,
         NoiseLevel::High => Self::NoiseLevelHigh,
         NoiseLevel::Off => Self::NoiseLevelOff,
      }
   }

   pub const fn set_auto_off(timeout: AutoOffTimeout) -> Self {
      match timeout {
         AutoOffTimeout::Never => Self::AutoOffNever,
         AutoOffTimeout::Min20 => Self::AutoOff20,
         AutoOffTimeout::Min60 => Self::AutoOff60,
         AutoOffTimeout::Min180 => Self::AutoOff180,
      }
   }

   /// `None` for [`ButtonMode::Error`], which is report-only.
   pub const fn set_button_mode(mode: ButtonMode) -> Option<Self> {
      match mode {
         ButtonMode::Alexa => Some(Self::ButtonModeAlexa),
         ButtonMode::NoiseControl => Some(Self::ButtonModeNoiseControl),
         ButtonMode::Error => None,
      }
   }
}

/// A single byte-match rule within an acknowledgement pattern.
///
/// Wildcards are a dedicated variant rather than a sentinel byte, so a
/// wildcard position can never collide with a legitimate payload value and
/// never participates in equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
   Lit(u8),
   Any,
}

impl Rule {
   pub const fn matches(self, byte: u8) -> bool {
      match self {
         Self::Lit(value) => value == byte,
         Self::Any => true,
      }
   }
}

/// Acknowledgement frame kinds the headphones send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum AckKind {
   Connect,
   Ack1,
   Ack2,
   Name,
   AutoOff,
   NoiseLevel,
   Language,
   Battery,
   ButtonAction,
   Unknown,
}

/// An ordered sequence of byte-match rules identifying one frame kind.
#[derive(Debug, Clone, Copy)]
pub struct AckPattern {
   pub kind: AckKind,
   pub rules: &'static [Rule],
}

impl AckPattern {
   pub const fn len(&self) -> usize {
      self.rules.len()
   }

   pub const fn is_empty(&self) -> bool {
      self.rules.is_empty()
   }

   /// Whether this pattern matches the start of `buf`.
   ///
   /// Only eligible when the pattern is no longer than the buffer.
   pub fn matches_prefix(&self, buf: &[u8]) -> bool {
      buf.len() >= self.rules.len()
         && self.rules.iter().zip(buf).all(|(rule, &byte)| rule.matches(byte))
   }
}

use Rule::{Any, Lit};

/// Acknowledgement catalog, checked in declaration order.
///
/// Order is part of the contract: the first satisfying pattern wins, so
/// more specific patterns precede the ones that would otherwise shadow them.
pub const ACK_CATALOG: &[AckPattern] = &[
   AckPattern {
      kind: AckKind::Connect,
      rules: &[Lit(0x00), Lit(0x01), Lit(0x03), Lit(0x05)],
   },
   AckPattern {
      kind: AckKind::Ack1,
      rules: &[Lit(0x01), Lit(0x01), Lit(0x07), Lit(0x00)],
   },
   AckPattern {
      kind: AckKind::Ack2,
      rules: &[Lit(0x01), Lit(0x01), Lit(0x06), Lit(0x00)],
   },
   AckPattern {
      kind: AckKind::Name,
      rules: &[Lit(0x01), Lit(0x02), Lit(0x03), Any, Lit(0x00)],
   },
   AckPattern {
      kind: AckKind::AutoOff,
      rules: &[Lit(0x01), Lit(0x04), Lit(0x03), Lit(0x01), Any],
   },
   AckPattern {
      kind: AckKind::NoiseLevel,
      rules: &[Lit(0x01), Lit(0x06), Lit(0x03), Lit(0x02), Any, Lit(0x0b)],
   },
   AckPattern {
      kind: AckKind::Language,
      rules: &[
         Lit(0x01),
         Lit(0x03),
         Lit(0x03),
         Lit(0x05),
         Any,
         Lit(0x00),
         Any,
         Any,
         Lit(0xde),
      ],
   },
   AckPattern {
      kind: AckKind::Battery,
      rules: &[Lit(0x02), Lit(0x02), Lit(0x03), Lit(0x01)],
   },
   AckPattern {
      kind: AckKind::ButtonAction,
      rules: &[
         Lit(0x01),
         Lit(0x09),
         Lit(0x03),
         Lit(0x04),
         Lit(0x10),
         Lit(0x04),
         Any,
         Lit(0x07),
      ],
   },
   AckPattern {
      kind: AckKind::Unknown,
      rules: &[Lit(0x7e), Lit(0x7e)],
   },
];

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn command_encodings() {
      assert_eq!(Command::Connect.bytes(), &[0x00, 0x01, 0x01, 0x00]);
      assert_eq!(
         Command::set_noise_level(NoiseLevel::Low).bytes(),
         &[0x01, 0x06, 0x02, 0x01, 0x03]
      );
      assert_eq!(
         Command::set_noise_level(NoiseLevel::High).bytes(),
         &[0x01, 0x06, 0x02, 0x01, 0x01]
      );
      assert_eq!(
         Command::set_noise_level(NoiseLevel::Off).bytes(),
         &[0x01, 0x06, 0x02, 0x01, 0x00]
      );
      assert_eq!(
         Command::set_auto_off(AutoOffTimeout::Min180).bytes(),
         &[0x01, 0x04, 0x02, 0x01, 0xb4]
      );
      assert_eq!(Command::GetDeviceStatus.bytes(), &[0x01, 0x01, 0x05, 0x00]);
      assert_eq!(Command::GetBatteryLevel.bytes(), &[0x02, 0x02, 0x01, 0x00]);
      assert_eq!(
         Command::ButtonModeNoiseControl.bytes(),
         &[0x01, 0x09, 0x02, 0x03, 0x10, 0x04, 0x02]
      );
   }

   #[test]
   fn button_mode_error_is_not_assignable() {
      assert_eq!(
         Command::set_button_mode(ButtonMode::Alexa),
         Some(Command::ButtonModeAlexa)
      );
      assert_eq!(Command::set_button_mode(ButtonMode::Error), None);
   }

   #[test]
   fn command_symbolic_names() {
      use std::str::FromStr;
      assert_eq!(Command::from_str("connect"), Ok(Command::Connect));
      assert_eq!(Command::from_str("noise_high"), Ok(Command::NoiseLevelHigh));
      assert_eq!(Command::from_str("get_battery"), Ok(Command::GetBatteryLevel));
      assert!(Command::from_str("reboot").is_err());
   }

   #[test]
   fn wildcard_positions_match_any_byte() {
      let name = &ACK_CATALOG[3];
      assert_eq!(name.kind, AckKind::Name);
      assert!(name.matches_prefix(&[0x01, 0x02, 0x03, 0x0d, 0x00]));
      assert!(name.matches_prefix(&[0x01, 0x02, 0x03, 0x7f, 0x00]));
      assert!(!name.matches_prefix(&[0x01, 0x02, 0x03, 0x0d, 0x01]));
   }

   #[test]
   fn pattern_longer_than_buffer_never_matches() {
      let connect = &ACK_CATALOG[0];
      assert!(!connect.matches_prefix(&[0x00, 0x01, 0x03]));
      assert!(connect.matches_prefix(&[0x00, 0x01, 0x03, 0x05]));
   }

   #[test]
   fn wire_codes_round_trip() {
      assert_eq!(NoiseLevel::from_repr(0x03), Some(NoiseLevel::Low));
      assert_eq!(NoiseLevel::from_repr(0x01), Some(NoiseLevel::High));
      assert_eq!(NoiseLevel::from_repr(0x00), Some(NoiseLevel::Off));
      assert_eq!(NoiseLevel::from_repr(0x02), None);
      assert_eq!(ButtonMode::from_repr(0x7f), Some(ButtonMode::Error));
      assert_eq!(ButtonMode::from_repr(0x03), None);
      assert_eq!(AutoOffTimeout::from_repr(60), Some(AutoOffTimeout::Min60));
   }
}
