//! Configuration management for the QC35 control service.
//!
//! This module handles loading and saving configuration from disk,
//! covering the RFCOMM channel and the session's timing tunables.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Qc35Error, Result};

/// Main configuration structure for the service.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
   /// RFCOMM channel carrying the control protocol.
   #[serde(default = "default_rfcomm_channel")]
   pub rfcomm_channel: u8,

   /// Reader poll interval in milliseconds while the link is idle.
   #[serde(default = "default_read_poll_ms")]
   pub read_poll_ms: u64,

   /// Idle reader ticks before a status/battery keepalive pair is enqueued.
   #[serde(default = "default_idle_keepalive_ticks")]
   pub idle_keepalive_ticks: u32,

   /// Writer's bounded wait on the outbound queue, in seconds.
   #[serde(default = "default_write_poll_secs")]
   pub write_poll_secs: u64,

   /// Maximum time to wait for the RFCOMM socket to open, in seconds.
   #[serde(default = "default_connect_timeout_secs")]
   pub connect_timeout_secs: u64,
}

const fn default_rfcomm_channel() -> u8 {
   8
}

const fn default_read_poll_ms() -> u64 {
   100
}

const fn default_idle_keepalive_ticks() -> u32 {
   15
}

const fn default_write_poll_secs() -> u64 {
   1
}

const fn default_connect_timeout_secs() -> u64 {
   10
}

impl Default for Config {
   fn default() -> Self {
      Self {
         rfcomm_channel: default_rfcomm_channel(),
         read_poll_ms: default_read_poll_ms(),
         idle_keepalive_ticks: default_idle_keepalive_ticks(),
         write_poll_secs: default_write_poll_secs(),
         connect_timeout_secs: default_connect_timeout_secs(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      // Ensure directory exists
      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(qc35_home) = env::var("QC35CTL_HOME") {
         PathBuf::from(qc35_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(Qc35Error::ConfigDirNotFound);
      };

      Ok(config_dir.join("qc35ctl").join("config.toml"))
   }

   pub const fn read_poll(&self) -> Duration {
      Duration::from_millis(self.read_poll_ms)
   }

   pub const fn write_poll(&self) -> Duration {
      Duration::from_secs(self.write_poll_secs)
   }

   pub const fn connect_timeout(&self) -> Duration {
      Duration::from_secs(self.connect_timeout_secs)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn round_trips_through_toml_with_defaults() {
      let dir = tempfile::tempdir().expect("tempdir");
      // SAFETY: test-only process-local override, no concurrent env access.
      unsafe {
         env::set_var("QC35CTL_HOME", dir.path());
      }

      let config = Config {
         rfcomm_channel: 4,
         ..Default::default()
      };
      config.save().expect("save");

      let loaded = Config::load().expect("load");
      assert_eq!(loaded.rfcomm_channel, 4);
      assert_eq!(loaded.read_poll_ms, 100);
      assert_eq!(loaded.idle_keepalive_ticks, 15);
      assert_eq!(loaded.write_poll_secs, 1);
      assert_eq!(loaded.connect_timeout_secs, 10);
   }

   #[test]
   fn partial_file_fills_defaults() {
      let config: Config = toml::from_str("rfcomm_channel = 2\n").expect("parse");
      assert_eq!(config.rfcomm_channel, 2);
      assert_eq!(config.idle_keepalive_ticks, 15);
   }
}
