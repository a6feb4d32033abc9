use std::fs;

use serde::{Deserialize, Serialize};

use crate::llrp::{Modulation, LLRP_PORT};

/// Configuration file for the `inventory` binary.
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {

  pub hosts : Vec<String>,

  #[serde(default = "default_port")]
  pub port : u16,

  #[serde(default)]
  pub duration : f32,

  #[serde(default = "default_report_every_n_tags")]
  pub report_every_n_tags : u16,

  #[serde(default)]
  pub report_timeout_ms : u32,

  #[serde(default = "default_antennas")]
  pub antennas : Vec<u16>,

  #[serde(default)]
  pub tx_power : u16,

  #[serde(default = "default_modulation")]
  pub modulation : String,

  #[serde(default)]
  pub tari : u32,

  #[serde(default = "default_session")]
  pub session : u8,

  #[serde(default = "default_tag_population")]
  pub tag_population : u16,

  #[serde(default)]
  pub reconnect : bool,

  #[serde(default = "default_connect_timeout_ms")]
  pub connect_timeout_ms : u64,

  #[serde(default = "default_log_level")]
  pub log_level : String
}

fn default_port() -> u16 {
  LLRP_PORT
}

fn default_report_every_n_tags() -> u16 {
  1
}

fn default_antennas() -> Vec<u16> {
  vec![1]
}

fn default_modulation() -> String {
  "M4".to_string()
}

fn default_session() -> u8 {
  2
}

fn default_tag_population() -> u16 {
  4
}

fn default_connect_timeout_ms() -> u64 {
  3000
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {

  pub fn validate(&self) -> Result<(), String> {
    if self.hosts.is_empty() {
      return Err("at least one reader host is required".into());
    }

    if self.session > 3 {
      return Err(format!("session must be 0..=3, got {}", self.session));
    }

    if self.tag_population == 0 {
      return Err("tag_population must be at least 1".into());
    }

    if self.report_every_n_tags == 0 {
      return Err("report_every_n_tags must be at least 1".into());
    }

    if self.antennas.is_empty() {
      return Err("at least one antenna is required".into());
    }

    if self.modulation.parse::<Modulation>().is_err() {
      return Err(format!(
        "unknown modulation {:?} (expected one of FM0, M2, M4, M8)", self.modulation
      ));
    }

    Ok(())
  }
}

pub fn load_config(file_path: &str) -> Result<Config, Box<dyn std::error::Error>> {

  let config_data = fs::read_to_string(file_path)?;
  let config: Config = serde_json::from_str(&config_data)?;

  Ok(config)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn minimal_config_gets_defaults() {
    let config: Config = serde_json::from_str(r#"{ "hosts": ["192.168.1.102"] }"#).unwrap();
    assert_eq!(config.port, LLRP_PORT);
    assert_eq!(config.antennas, vec![1]);
    assert_eq!(config.session, 2);
    assert_eq!(config.modulation, "M4");
    assert!(config.validate().is_ok());
  }

  #[test]
  fn bad_session_is_rejected() {
    let config: Config = serde_json::from_str(
      r#"{ "hosts": ["192.168.1.102"], "session": 7 }"#
    ).unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn unknown_modulation_is_rejected() {
    let config: Config = serde_json::from_str(
      r#"{ "hosts": ["192.168.1.102"], "modulation": "QAM64" }"#
    ).unwrap();
    assert!(config.validate().is_err());
  }
}
