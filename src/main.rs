//! QC35 control D-Bus service.
//!
//! This daemon keeps an RFCOMM session to a Bose QC35 headset, decodes its
//! acknowledgement stream into typed events, and exposes command
//! submission plus event signals over D-Bus.

use std::{env, str::FromStr};

use bluer::Address;
use log::{info, warn};
use tokio::signal;
use zbus::{Connection, connection, object_server::InterfaceRef};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod qc35;

use crate::{
   dbus::{SessionService, SessionServiceSignals, StatusCache},
   error::{Qc35Error, Result},
   event::Event,
   qc35::session::{EventStream, Session},
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting qc35ctld D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;

   // Create the session and its event stream
   let (session, events) = Session::new(config);

   // Shared status snapshot, fed by the event pump below
   let status = StatusCache::new();

   // Build D-Bus connection
   let service = SessionService::new(session.clone(), status.clone());
   let connection = connection::Builder::session()?
      .name("org.qc35ctl")?
      .serve_at("/org/qc35ctl/session", service)?
      .build()
      .await?;

   info!("qc35ctld D-Bus service started at org.qc35ctl");

   // Start event pump
   spawn_event_pump(&connection, events, status).await?;

   // Optional initial target on the command line (XX:XX:XX:XX:XX:XX)
   if let Some(arg) = env::args().nth(1) {
      let target = Address::from_str(&arg)
         .map_err(|e| Qc35Error::InvalidAddress(format!("{arg}: {e}")))?;
      session.connect(target).await?;
   }

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down qc35ctld...");
   session.disconnect().await?;

   Ok(())
}

/// Forwards session events to D-Bus signals and the status cache.
async fn spawn_event_pump(
   connection: &Connection,
   events: EventStream,
   status: StatusCache,
) -> Result<()> {
   let iface = connection
      .object_server()
      .interface::<_, SessionService>("/org/qc35ctl/session")
      .await?;

   tokio::spawn(async move {
      while let Some(event) = events.recv().await {
         status.apply(&event);
         if let Err(e) = dispatch(&iface, &event).await {
            warn!("Error dispatching event: {e}");
         }
      }
   });

   Ok(())
}

async fn dispatch(iface: &InterfaceRef<SessionService>, event: &Event) -> Result<()> {
   match event {
      Event::Disconnected(reason) => {
         let reason = reason.as_deref().unwrap_or("");
         info!("Disconnected: {reason}");
         iface.disconnected(reason).await?;
      },
      Event::Connecting => {
         iface.connecting().await?;
      },
      Event::Connected(firmware) => {
         info!("Connected, firmware {firmware}");
         iface.connected(firmware).await?;
      },
      Event::NoiseLevel(level) => {
         iface.noise_level_changed(&level.to_string()).await?;
      },
      Event::DeviceName(name) => {
         iface.device_name_changed(name).await?;
      },
      Event::AutoOffPeriod(minutes) => {
         iface.auto_off_changed(*minutes).await?;
      },
      Event::BatteryLevel(percent) => {
         iface.battery_level_changed(*percent).await?;
      },
      Event::ButtonMode(mode) => {
         iface.button_mode_changed(&mode.to_string()).await?;
      },
      Event::Unknown(detail) => {
         if let Some(detail) = detail {
            iface.protocol_anomaly(detail).await?;
         }
      },
   }
   Ok(())
}
