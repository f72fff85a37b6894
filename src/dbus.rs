//! D-Bus interface for the QC35 control service.
//!
//! Exposes the session's command-submission entry point and mirrors every
//! session event as a signal, plus a JSON `status` property fed by the
//! event pump in `main`.

use std::{str::FromStr, sync::Arc};

use bluer::Address;
use log::info;
use parking_lot::Mutex;
use serde_json::json;
use smol_str::SmolStr;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   event::Event,
   qc35::{
      protocol::{AutoOffTimeout, ButtonMode, Command, NoiseLevel},
      session::Session,
   },
};

/// Last-known accessory state, rebuilt from the event stream.
struct Status {
   state: &'static str,
   firmware: Option<SmolStr>,
   name: Option<SmolStr>,
   noise_level: Option<NoiseLevel>,
   auto_off_minutes: Option<u8>,
   battery_percent: Option<u8>,
   button_mode: Option<ButtonMode>,
}

impl Default for Status {
   fn default() -> Self {
      Self {
         state: "disconnected",
         firmware: None,
         name: None,
         noise_level: None,
         auto_off_minutes: None,
         battery_percent: None,
         button_mode: None,
      }
   }
}

/// Shared snapshot of the accessory state.
///
/// The event pump applies events as they arrive; the D-Bus `status`
/// property reads it on demand.
#[derive(Clone, Default)]
pub struct StatusCache(Arc<Mutex<Status>>);

impl StatusCache {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn apply(&self, event: &Event) {
      let mut status = self.0.lock();
      match event {
         Event::Disconnected(_) => {
            status.state = "disconnected";
            status.firmware = None;
         },
         Event::Connecting => status.state = "connecting",
         Event::Connected(firmware) => {
            status.state = "connected";
            status.firmware = Some(firmware.clone());
         },
         Event::NoiseLevel(level) => status.noise_level = Some(*level),
         Event::DeviceName(name) => status.name = Some(name.clone()),
         Event::AutoOffPeriod(minutes) => status.auto_off_minutes = Some(*minutes),
         Event::BatteryLevel(percent) => status.battery_percent = Some(*percent),
         Event::ButtonMode(mode) => status.button_mode = Some(*mode),
         Event::Unknown(_) => {},
      }
   }

   pub fn to_json(&self) -> serde_json::Value {
      let status = self.0.lock();
      json!({
          "state": status.state,
          "firmware": status.firmware.as_deref(),
          "name": status.name.as_deref(),
          "noise_level": status.noise_level.map(|l| l.to_string()),
          "auto_off_minutes": status.auto_off_minutes,
          "battery_percent": status.battery_percent,
          "button_mode": status.button_mode.map(|m| m.to_string()),
      })
   }
}

pub struct SessionService {
   session: Session,
   status: StatusCache,
}

impl SessionService {
   pub const fn new(session: Session, status: StatusCache) -> Self {
      Self { session, status }
   }
}

#[interface(name = "org.qc35ctl.Session")]
impl SessionService {
   async fn connect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr =
         Address::from_str(&address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      self
         .session
         .connect(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      info!("Connection to {address} requested");
      Ok(true)
   }

   async fn disconnect_device(&self) -> zbus::fdo::Result<bool> {
      self
         .session
         .disconnect()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   /// Submits a command by its symbolic name, e.g. `noise_high` or
   /// `get_battery`.
   async fn send_command(&self, name: String) -> zbus::fdo::Result<bool> {
      let command = Command::from_str(&name)
         .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Unknown command: {name}")))?;

      self.session.submit(command);
      info!("Queued command {command}");
      Ok(true)
   }

   async fn set_noise_level(&self, level: String) -> zbus::fdo::Result<bool> {
      let level = NoiseLevel::from_str(&level)
         .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Invalid noise level: {level}")))?;

      self.session.submit(Command::set_noise_level(level));
      Ok(true)
   }

   async fn set_auto_off(&self, timeout: String) -> zbus::fdo::Result<bool> {
      let timeout = AutoOffTimeout::from_str(&timeout)
         .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Invalid auto-off: {timeout}")))?;

      self.session.submit(Command::set_auto_off(timeout));
      Ok(true)
   }

   async fn set_button_mode(&self, mode: String) -> zbus::fdo::Result<bool> {
      let parsed = ButtonMode::from_str(&mode)
         .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Invalid button mode: {mode}")))?;
      let command = Command::set_button_mode(parsed)
         .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("Not assignable: {mode}")))?;

      self.session.submit(command);
      Ok(true)
   }

   // Signals

   #[zbus(signal)]
   pub async fn connecting(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connected(emitter: &SignalEmitter<'_>, firmware: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn disconnected(emitter: &SignalEmitter<'_>, reason: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn noise_level_changed(emitter: &SignalEmitter<'_>, level: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_name_changed(emitter: &SignalEmitter<'_>, name: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn auto_off_changed(emitter: &SignalEmitter<'_>, minutes: u8) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_level_changed(
      emitter: &SignalEmitter<'_>,
      percent: u8,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn button_mode_changed(emitter: &SignalEmitter<'_>, mode: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn protocol_anomaly(emitter: &SignalEmitter<'_>, detail: &str) -> zbus::Result<()>;

   // Property for polling-free status reads
   #[zbus(property)]
   async fn status(&self) -> String {
      self.status.to_json().to_string()
   }
}
