//! Configuration management for the serial link service.
//!
//! This module handles loading and saving configuration from disk,
//! including the adapter to use and the link parameters.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
   /// Adapter name such as `hci0`. The system default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default = "default_chunk_size")]
   pub chunk_size: usize,

   #[serde(default = "default_profile_name")]
   pub profile_name: String,

   #[serde(default = "default_write_timeout")]
   pub write_timeout_sec: u64,
}

const fn default_chunk_size() -> usize {
   256
}

fn default_profile_name() -> String {
   "Serial Port".to_string()
}

const fn default_write_timeout() -> u64 {
   25
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         chunk_size: default_chunk_size(),
         profile_name: default_profile_name(),
         write_timeout_sec: default_write_timeout(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(spplink_home) = env::var("SPPLINK_HOME") {
         PathBuf::from(spplink_home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(LinkError::ConfigDirNotFound);
      };

      Ok(config_dir.join("spplinkd").join("config.toml"))
   }

   /// Receive buffer size, never zero.
   pub fn chunk_size(&self) -> usize {
      self.chunk_size.max(1)
   }

   pub const fn write_timeout(&self) -> Duration {
      Duration::from_secs(self.write_timeout_sec)
   }
}
