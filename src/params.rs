use std::fmt;
use std::net::SocketAddr;

use bytes::Buf;
use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::error::LlrpError;
use crate::llrp::{
  Modulation,
  PARAM_ANTENNA_EVENT,
  PARAM_C1G2_UHF_RF_MODE_TABLE,
  PARAM_C1G2_UHF_RF_MODE_TABLE_ENTRY,
  PARAM_CONNECTION_ATTEMPT_EVENT,
  PARAM_CONNECTION_CLOSE_EVENT,
  PARAM_EPC_DATA,
  PARAM_GENERAL_DEVICE_CAPABILITIES,
  PARAM_LLRP_STATUS,
  PARAM_READER_EVENT_NOTIFICATION_DATA,
  PARAM_REGULATORY_CAPABILITIES,
  PARAM_TAG_REPORT_DATA,
  PARAM_TRANSMIT_POWER_LEVEL_TABLE_ENTRY,
  PARAM_UHF_BAND_CAPABILITIES,
  PARAM_UTC_TIME_STAMP,
  TV_ACCESS_SPEC_ID,
  TV_ANTENNA_ID,
  TV_C1G2_CRC,
  TV_C1G2_PC,
  TV_CHANNEL_INDEX,
  TV_EPC_96,
  TV_FIRST_SEEN_TIMESTAMP_UPTIME,
  TV_FIRST_SEEN_TIMESTAMP_UTC,
  TV_INVENTORY_PARAMETER_SPEC_ID,
  TV_LAST_SEEN_TIMESTAMP_UPTIME,
  TV_LAST_SEEN_TIMESTAMP_UTC,
  TV_OP_SPEC_ID,
  TV_PEAK_RSSI,
  TV_RO_SPEC_ID,
  TV_SPEC_INDEX,
  TV_TAG_SEEN_COUNT,
};

pub const STATUS_SUCCESS: u16 = 0;

/// One parameter lifted off the wire: either a TLV (16-bit type, explicit
/// length) or a TV (7-bit type, implicit fixed length).
#[derive(Debug, Clone)]
pub struct LlrpParameter {

  pub param_type : u16,
  pub tv         : bool,
  pub value      : Vec<u8>
}

impl LlrpParameter {

  pub fn sub_parameters(&self) -> Result<Vec<LlrpParameter>, LlrpError> {
    parse_parameters(&self.value)
  }
}

/// Value length for a TV parameter type, excluding the type octet.
pub fn tv_param_length(param_type: u8) -> Option<usize> {
  match param_type {
    TV_ANTENNA_ID                  => Some(2),
    TV_FIRST_SEEN_TIMESTAMP_UTC    => Some(8),
    TV_FIRST_SEEN_TIMESTAMP_UPTIME => Some(8),
    TV_LAST_SEEN_TIMESTAMP_UTC     => Some(8),
    TV_LAST_SEEN_TIMESTAMP_UPTIME  => Some(8),
    TV_PEAK_RSSI                   => Some(1),
    TV_CHANNEL_INDEX               => Some(2),
    TV_TAG_SEEN_COUNT              => Some(2),
    TV_RO_SPEC_ID                  => Some(4),
    TV_INVENTORY_PARAMETER_SPEC_ID => Some(2),
    TV_C1G2_CRC                    => Some(2),
    TV_C1G2_PC                     => Some(2),
    TV_EPC_96                      => Some(12),
    TV_SPEC_INDEX                  => Some(2),
    TV_ACCESS_SPEC_ID              => Some(4),
    TV_OP_SPEC_ID                  => Some(2),
    _ => None
  }
}

/// Walks a byte range containing a flat sequence of TV and TLV parameters.
///
/// Nesting is not resolved here; callers descend with `sub_parameters`.
pub fn parse_parameters(buf: &[u8]) -> Result<Vec<LlrpParameter>, LlrpError> {

  let mut parameters = Vec::new();
  let mut index = 0;
  let buf_len = buf.len();

  while index < buf_len {

    let first_byte = buf[index];
    if (first_byte & 0x80) != 0 {

      let param_type = first_byte & 0x7F;
      index += 1;

      let value_length = tv_param_length(param_type).ok_or(LlrpError::Codec {
        parameter: "TV",
        reason: format!("unknown TV parameter type {}", param_type)
      })?;

      if buf_len - index < value_length {
        return Err(LlrpError::Codec {
          parameter: "TV",
          reason: format!("buffer too short for TV parameter {}", param_type)
        });
      }

      parameters.push(LlrpParameter {
        param_type: param_type as u16,
        tv: true,
        value: buf[index..index + value_length].to_vec()
      });
      index += value_length;

    } else {

      if buf_len - index < 4 {
        return Err(LlrpError::short("TLV header"));
      }

      let param_type = (((buf[index] as u16) << 8) | buf[index + 1] as u16) & 0x3FF;
      let param_length = ((buf[index + 2] as u16) << 8) | buf[index + 3] as u16;
      index += 4;

      if param_length < 4 || (param_length - 4) as usize > buf_len - index {
        return Err(LlrpError::Codec {
          parameter: "TLV",
          reason: format!("invalid length {} for parameter type {}", param_length, param_type)
        });
      }

      let value_length = (param_length - 4) as usize;
      parameters.push(LlrpParameter {
        param_type,
        tv: false,
        value: buf[index..index + value_length].to_vec()
      });
      index += value_length;
    }
  }

  Ok(parameters)
}

/// LLRPStatus parameter: numeric code plus UTF-8 error description.
#[derive(Debug, Clone)]
pub struct LlrpStatus {

  pub status_code       : u16,
  pub error_description : String
}

impl LlrpStatus {

  pub fn decode(
    buf: &[u8]
  ) -> Result<Self, LlrpError> {

    let mut buf = buf;

    if buf.remaining() < 4 {
      return Err(LlrpError::short("LLRPStatus"));
    }

    let status_code = buf.get_u16();
    let desc_length = buf.get_u16() as usize;

    if buf.remaining() < desc_length {
      return Err(LlrpError::short("LLRPStatus error description"));
    }

    let error_description = String::from_utf8_lossy(&buf[..desc_length]).into_owned();

    // FieldError / ParameterError sub-parameters may follow; nothing in the
    // state machine consumes them.

    Ok(LlrpStatus {
      status_code,
      error_description
    })
  }

  pub fn is_success(&self) -> bool {
    self.status_code == STATUS_SUCCESS
  }
}

/// Pulls the LLRPStatus out of a `*_RESPONSE` payload.
pub fn decode_status(payload: &[u8]) -> Result<LlrpStatus, LlrpError> {
  for param in parse_parameters(payload)? {
    if param.param_type == PARAM_LLRP_STATUS {
      return LlrpStatus::decode(&param.value);
    }
  }

  Err(LlrpError::Codec {
    parameter: "LLRPStatus",
    reason: "response carries no LLRPStatus parameter".into()
  })
}

#[derive(Debug, Clone)]
pub struct AntennaEvent {

  pub connected  : bool,
  pub antenna_id : u16
}

/// Decoded READER_EVENT_NOTIFICATION payload. Only the events the state
/// machine reacts to are lifted; everything else is left in the raw list.
#[derive(Debug, Clone, Default)]
pub struct ReaderEventNotificationData {

  pub timestamp_us       : Option<u64>,
  pub connection_attempt : Option<u16>,
  pub antenna_event      : Option<AntennaEvent>,
  pub connection_close   : bool
}

pub const CONNECTION_ATTEMPT_SUCCESS: u16 = 0;

impl ReaderEventNotificationData {

  pub fn decode(
    payload: &[u8]
  ) -> Result<Self, LlrpError> {

    let mut data = ReaderEventNotificationData::default();

    for param in parse_parameters(payload)? {
      if param.param_type != PARAM_READER_EVENT_NOTIFICATION_DATA {
        debug!("skipping parameter {} in reader event notification", param.param_type);
        continue;
      }

      for event in param.sub_parameters()? {
        let mut value: &[u8] = &event.value;

        match event.param_type {

          PARAM_UTC_TIME_STAMP => {
            if value.remaining() < 8 {
              return Err(LlrpError::short("UTCTimestamp"));
            }
            data.timestamp_us = Some(value.get_u64());
          }

          PARAM_CONNECTION_ATTEMPT_EVENT => {
            if value.remaining() < 2 {
              return Err(LlrpError::short("ConnectionAttemptEvent"));
            }
            data.connection_attempt = Some(value.get_u16());
          }

          PARAM_ANTENNA_EVENT => {
            if value.remaining() < 3 {
              return Err(LlrpError::short("AntennaEvent"));
            }
            let event_type = value.get_u8();
            let antenna_id = value.get_u16();
            data.antenna_event = Some(AntennaEvent {
              connected: event_type == 1,
              antenna_id
            });
          }

          PARAM_CONNECTION_CLOSE_EVENT => {
            data.connection_close = true;
          }

          other => {
            debug!("unhandled reader event parameter type {}", other);
          }
        }
      }
    }

    Ok(data)
  }

  /// Connection attempts must report Success, antenna events Connected.
  /// An event carrying neither is not a go-ahead.
  pub fn is_success(&self) -> bool {
    if let Some(status) = self.connection_attempt {
      return status == CONNECTION_ATTEMPT_SUCCESS;
    }
    if let Some(ref ev) = self.antenna_event {
      return ev.connected;
    }
    false
  }
}

/// One TagReportData entry from an RO_ACCESS_REPORT.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagReport {

  pub epc                         : Vec<u8>,
  pub antenna_id                  : Option<u16>,
  pub peak_rssi                   : Option<i8>,
  pub channel_index               : Option<u16>,
  pub first_seen_utc              : Option<u64>,
  pub last_seen_utc               : Option<u64>,
  pub tag_seen_count              : Option<u16>,
  pub rospec_id                   : Option<u32>,
  pub spec_index                  : Option<u16>,
  pub inventory_parameter_spec_id : Option<u16>,
  pub access_spec_id              : Option<u32>,
  pub crc                         : Option<u16>,
  pub pc                          : Option<u16>
}

impl fmt::Display for TagReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {

    let epc_hex = self.epc.iter()
      .map(|byte| format!("{:02x}", byte))
      .collect::<Vec<String>>()
      .join("");

    write!(f, "epc={}", epc_hex)?;

    if let Some(rssi) = self.peak_rssi {
      write!(f, " rssi={}dBm", rssi)?;
    }
    if let Some(count) = self.tag_seen_count {
      write!(f, " seen={}", count)?;
    }
    if let Some(us) = self.last_seen_utc {
      if let Some(ts) = DateTime::<Utc>::from_timestamp_micros(us as i64) {
        write!(f, " last_seen={}", ts.format("%Y-%m-%dT%H:%M:%S%.6fZ"))?;
      }
    }

    Ok(())
  }
}

impl TagReport {

  pub fn decode(
    buf: &[u8]
  ) -> Result<Self, LlrpError> {

    let mut tag = TagReport::default();

    for param in parse_parameters(buf)? {
      let mut value: &[u8] = &param.value;

      if param.tv {
        match param.param_type as u8 {
          TV_EPC_96                      => tag.epc = param.value.clone(),
          TV_ANTENNA_ID                  => tag.antenna_id = Some(value.get_u16()),
          TV_PEAK_RSSI                   => tag.peak_rssi = Some(value.get_i8()),
          TV_CHANNEL_INDEX               => tag.channel_index = Some(value.get_u16()),
          TV_FIRST_SEEN_TIMESTAMP_UTC    => tag.first_seen_utc = Some(value.get_u64()),
          TV_LAST_SEEN_TIMESTAMP_UTC     => tag.last_seen_utc = Some(value.get_u64()),
          TV_TAG_SEEN_COUNT              => tag.tag_seen_count = Some(value.get_u16()),
          TV_RO_SPEC_ID                  => tag.rospec_id = Some(value.get_u32()),
          TV_SPEC_INDEX                  => tag.spec_index = Some(value.get_u16()),
          TV_INVENTORY_PARAMETER_SPEC_ID => tag.inventory_parameter_spec_id = Some(value.get_u16()),
          TV_ACCESS_SPEC_ID              => tag.access_spec_id = Some(value.get_u32()),
          TV_C1G2_CRC                    => tag.crc = Some(value.get_u16()),
          TV_C1G2_PC                     => tag.pc = Some(value.get_u16()),
          other => debug!("unhandled TV parameter {} in tag report", other)
        }
      } else if param.param_type == PARAM_EPC_DATA {
        if value.remaining() < 2 {
          return Err(LlrpError::short("EPCData"));
        }
        let bit_length = value.get_u16() as usize;
        let byte_length = (bit_length + 7) / 8;
        if value.remaining() < byte_length {
          return Err(LlrpError::short("EPCData EPC field"));
        }
        tag.epc = value[..byte_length].to_vec();
      } else {
        debug!("unhandled parameter {} in tag report", param.param_type);
      }
    }

    Ok(tag)
  }
}

/// Decoded RO_ACCESS_REPORT: the list of tag observations, stamped with the
/// reporting reader once the connection layer dispatches it.
#[derive(Debug, Clone, Default)]
pub struct RoAccessReport {

  pub peer : Option<SocketAddr>,
  pub tags : Vec<TagReport>
}

impl RoAccessReport {

  pub fn decode(
    payload: &[u8]
  ) -> Result<Self, LlrpError> {

    let mut tags = Vec::new();

    for param in parse_parameters(payload)? {
      if param.param_type == PARAM_TAG_REPORT_DATA {
        tags.push(TagReport::decode(&param.value)?);
      } else {
        debug!("unhandled parameter {} in RO_ACCESS_REPORT", param.param_type);
      }
    }

    Ok(RoAccessReport { peer: None, tags })
  }
}

#[derive(Debug, Clone)]
pub struct GeneralDeviceCapabilities {

  pub max_number_of_antennas_supported : u16,
  pub device_capability_bits           : u16,
  pub device_manufacturer_name         : u32,
  pub model_name                       : u32,
  pub reader_firmware_version          : String
}

impl GeneralDeviceCapabilities {

  pub fn decode(
    buf: &[u8]
  ) -> Result<Self, LlrpError> {

    let mut buf = buf;

    if buf.remaining() < 14 {
      return Err(LlrpError::short("GeneralDeviceCapabilities"));
    }

    let max_number_of_antennas_supported = buf.get_u16();
    let device_capability_bits = buf.get_u16();
    let device_manufacturer_name = buf.get_u32();
    let model_name = buf.get_u32();

    let firmware_length = buf.get_u16() as usize;
    if buf.remaining() < firmware_length {
      return Err(LlrpError::short("GeneralDeviceCapabilities firmware version"));
    }

    let reader_firmware_version = String::from_utf8_lossy(&buf[..firmware_length]).into_owned();

    // ReceiveSensitivityTableEntry / PerAntennaAirProtocol / GPIOCapabilities
    // sub-parameters follow; the inventory flow does not consume them.

    Ok(GeneralDeviceCapabilities {
      max_number_of_antennas_supported,
      device_capability_bits,
      device_manufacturer_name,
      model_name,
      reader_firmware_version
    })
  }
}

#[derive(Debug, Clone)]
pub struct TransmitPowerLevelTableEntry {

  pub index                : u16,
  pub transmit_power_value : u16
}

impl TransmitPowerLevelTableEntry {

  pub fn decode(
    buf: &[u8]
  ) -> Result<Self, LlrpError> {

    let mut buf = buf;

    if buf.remaining() < 4 {
      return Err(LlrpError::short("TransmitPowerLevelTableEntry"));
    }

    Ok(TransmitPowerLevelTableEntry {
      index: buf.get_u16(),
      transmit_power_value: buf.get_u16()
    })
  }
}

/// One C1G2UHFRFModeTableEntry: the reader-advertised RF mode.
#[derive(Debug, Clone, PartialEq)]
pub struct RfModeTableEntry {

  pub mode_identifier         : u32,
  pub dr                      : bool,
  pub epc_hag_conformance     : bool,
  pub m                       : u8,
  pub forward_link_modulation : u8,
  pub spectral_mask_indicator : u8,
  pub bdr                     : u32,
  pub pie                     : u32,
  pub min_tari                : u32,
  pub max_tari                : u32,
  pub step_tari               : u32
}

impl RfModeTableEntry {

  pub fn decode(
    buf: &[u8]
  ) -> Result<Self, LlrpError> {

    let mut buf = buf;

    if buf.remaining() < 28 {
      return Err(LlrpError::short("C1G2UHFRFModeTableEntry"));
    }

    let mode_identifier = buf.get_u32();

    let flags = buf.get_u8();
    let dr = (flags & 0x80) != 0;
    let epc_hag_conformance = (flags & 0x40) != 0;

    let m = buf.get_u8();
    let forward_link_modulation = buf.get_u8();
    let spectral_mask_indicator = buf.get_u8();
    let bdr = buf.get_u32();
    let pie = buf.get_u32();
    let min_tari = buf.get_u32();
    let max_tari = buf.get_u32();
    let step_tari = buf.get_u32();

    Ok(RfModeTableEntry {
      mode_identifier,
      dr,
      epc_hag_conformance,
      m,
      forward_link_modulation,
      spectral_mask_indicator,
      bdr,
      pie,
      min_tari,
      max_tari,
      step_tari
    })
  }
}

#[derive(Debug, Clone, Default)]
pub struct UhfBandCapabilities {

  pub transmit_power_levels : Vec<TransmitPowerLevelTableEntry>,
  pub rf_mode_table         : Vec<RfModeTableEntry>
}

impl UhfBandCapabilities {

  pub fn decode(
    buf: &[u8]
  ) -> Result<Self, LlrpError> {

    let mut caps = UhfBandCapabilities::default();

    for param in parse_parameters(buf)? {
      match param.param_type {

        PARAM_TRANSMIT_POWER_LEVEL_TABLE_ENTRY => {
          caps.transmit_power_levels.push(TransmitPowerLevelTableEntry::decode(&param.value)?);
        }

        PARAM_C1G2_UHF_RF_MODE_TABLE => {
          for entry in param.sub_parameters()? {
            if entry.param_type == PARAM_C1G2_UHF_RF_MODE_TABLE_ENTRY {
              caps.rf_mode_table.push(RfModeTableEntry::decode(&entry.value)?);
            } else {
              warn!("unexpected parameter {} in C1G2UHFRFModeTable", entry.param_type);
            }
          }
        }

        other => {
          debug!("unhandled parameter {} in UHFBandCapabilities", other);
        }
      }
    }

    Ok(caps)
  }
}

#[derive(Debug, Clone)]
pub struct RegulatoryCapabilities {

  pub country_code            : u16,
  pub communications_standard : u16,
  pub uhf_band                : Option<UhfBandCapabilities>
}

impl RegulatoryCapabilities {

  pub fn decode(
    buf: &[u8]
  ) -> Result<Self, LlrpError> {

    let mut cursor: &[u8] = buf;

    if cursor.remaining() < 4 {
      return Err(LlrpError::short("RegulatoryCapabilities"));
    }

    let country_code = cursor.get_u16();
    let communications_standard = cursor.get_u16();

    let mut uhf_band = None;
    for param in parse_parameters(cursor)? {
      if param.param_type == PARAM_UHF_BAND_CAPABILITIES {
        uhf_band = Some(UhfBandCapabilities::decode(&param.value)?);
      } else {
        debug!("unhandled parameter {} in RegulatoryCapabilities", param.param_type);
      }
    }

    Ok(RegulatoryCapabilities {
      country_code,
      communications_standard,
      uhf_band
    })
  }
}

/// Everything the client keeps from GET_READER_CAPABILITIES_RESPONSE.
/// Captured once after connect; never mutated.
#[derive(Debug, Clone)]
pub struct ReaderCapabilities {

  pub status     : LlrpStatus,
  pub general    : Option<GeneralDeviceCapabilities>,
  pub regulatory : Option<RegulatoryCapabilities>
}

impl ReaderCapabilities {

  pub fn decode(
    payload: &[u8]
  ) -> Result<Self, LlrpError> {

    let mut status = None;
    let mut general = None;
    let mut regulatory = None;

    for param in parse_parameters(payload)? {
      match param.param_type {

        PARAM_LLRP_STATUS => {
          status = Some(LlrpStatus::decode(&param.value)?);
        }

        PARAM_GENERAL_DEVICE_CAPABILITIES => {
          general = Some(GeneralDeviceCapabilities::decode(&param.value)?);
        }

        PARAM_REGULATORY_CAPABILITIES => {
          regulatory = Some(RegulatoryCapabilities::decode(&param.value)?);
        }

        other => {
          debug!("unhandled parameter {} in capabilities response", other);
        }
      }
    }

    let status = status.ok_or(LlrpError::Codec {
      parameter: "GET_READER_CAPABILITIES_RESPONSE",
      reason: "response carries no LLRPStatus parameter".into()
    })?;

    Ok(ReaderCapabilities {
      status,
      general,
      regulatory
    })
  }
}

/// Result of matching the user's radio wishes against the reader's tables.
#[derive(Debug, Clone)]
pub struct NegotiatedRadio {

  pub antennas       : Vec<u16>,
  pub tx_power_index : u16,
  pub tx_power_dbm   : f64,
  pub tx_power_table : Vec<f64>,
  pub mode           : RfModeTableEntry
}

/// Drops antennas above the reader's supported count, warning about each.
/// An empty survivor set is a capability mismatch.
pub fn validate_antennas(requested: &[u16], max_supported: u16) -> Result<Vec<u16>, LlrpError> {

  let valid: Vec<u16> = requested.iter().copied().filter(|a| *a <= max_supported).collect();

  if valid.len() != requested.len() {
    warn!(
      "invalid antenna set specified: requested={:?}, available=1..={}; ignoring invalid antennas",
      requested, max_supported
    );
  }

  if valid.is_empty() {
    return Err(LlrpError::CapabilityMismatch(format!(
      "no requested antenna is supported (requested {:?}, reader supports 1..={})",
      requested, max_supported
    )));
  }

  Ok(valid)
}

/// Builds the dBm-indexed transmit power table: index 0 is a 0.0 sentinel,
/// entries land at their advertised index, values are hundredths of dBm.
pub fn parse_power_table(band: &UhfBandCapabilities) -> Vec<f64> {

  let max_index = band.transmit_power_levels.iter().map(|e| e.index).max().unwrap_or(0);
  let mut table = vec![0.0; max_index as usize + 1];

  for entry in &band.transmit_power_levels {
    table[entry.index as usize] = entry.transmit_power_value as f64 / 100.0;
  }

  table
}

/// Validates a requested power index against the table; 0 selects max power.
pub fn select_tx_power(requested: u16, table: &[f64]) -> Result<(u16, f64), LlrpError> {

  if table.len() < 2 {
    return Err(LlrpError::CapabilityMismatch(
      "reader advertised an empty transmit power table".into()
    ));
  }

  if requested == 0 {
    let (index, dbm) = table.iter().enumerate()
      .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
      .map(|(i, v)| (i as u16, *v))
      .unwrap_or((0, 0.0));
    return Ok((index, dbm));
  }

  if (requested as usize) < table.len() {
    return Ok((requested, table[requested as usize]));
  }

  Err(LlrpError::InvalidTxPower {
    requested,
    min: 1,
    max: (table.len() - 1) as u16
  })
}

/// First mode entry matching the requested modulation; Tari equality is only
/// required when the caller asked for a specific Tari. No match falls back
/// to the table's first entry with a warning.
pub fn select_mode(
  table: &[RfModeTableEntry],
  modulation: Modulation,
  tari: u32
) -> Result<RfModeTableEntry, LlrpError> {

  if table.is_empty() {
    return Err(LlrpError::CapabilityMismatch(
      "reader advertised an empty UHF RF mode table".into()
    ));
  }

  for entry in table {
    if entry.m == modulation.type_code() && (tari == 0 || entry.max_tari == tari) {
      return Ok(entry.clone());
    }
  }

  if tari != 0 {
    warn!("could not find reader mode matching modulation={} and Tari={}", modulation, tari);
  } else {
    warn!("could not find reader mode matching modulation={}", modulation);
  }

  Ok(table[0].clone())
}

/// Full capability negotiation: antennas, transmit power index, RF mode.
pub fn negotiate(
  caps: &ReaderCapabilities,
  requested_antennas: &[u16],
  tx_power: u16,
  modulation: Modulation,
  tari: u32
) -> Result<NegotiatedRadio, LlrpError> {

  let general = caps.general.as_ref().ok_or_else(|| LlrpError::CapabilityMismatch(
    "reader reported no GeneralDeviceCapabilities".into()
  ))?;

  let antennas = validate_antennas(requested_antennas, general.max_number_of_antennas_supported)?;

  let band = caps.regulatory.as_ref().and_then(|r| r.uhf_band.as_ref())
    .ok_or_else(|| LlrpError::CapabilityMismatch(
      "reader reported no UHFBandCapabilities".into()
    ))?;

  let tx_power_table = parse_power_table(band);
  let (tx_power_index, tx_power_dbm) = select_tx_power(tx_power, &tx_power_table)?;
  let mode = select_mode(&band.rf_mode_table, modulation, tari)?;

  debug!(
    "negotiated radio: antennas={:?} tx_power={} ({} dBm) mode={}",
    antennas, tx_power_index, tx_power_dbm, mode.mode_identifier
  );

  Ok(NegotiatedRadio {
    antennas,
    tx_power_index,
    tx_power_dbm,
    tx_power_table,
    mode
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use bytes::{BytesMut, BufMut};

  fn tlv(param_type: u16, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u16(param_type);
    buf.put_u16(4 + body.len() as u16);
    buf.extend_from_slice(body);
    buf.to_vec()
  }

  fn rf_mode_entry_body(mode_identifier: u32, m: u8, max_tari: u32) -> Vec<u8> {
    let mut buf = BytesMut::new();
    buf.put_u32(mode_identifier);
    buf.put_u8(0x40);
    buf.put_u8(m);
    buf.put_u8(0);
    buf.put_u8(0);
    buf.put_u32(640_000);
    buf.put_u32(1500);
    buf.put_u32(6250);
    buf.put_u32(max_tari);
    buf.put_u32(0);
    buf.to_vec()
  }

  #[test]
  fn parses_mixed_tv_and_tlv_sequences() {
    let mut buf = Vec::new();
    buf.extend_from_slice(&tlv(PARAM_LLRP_STATUS, &[0x00, 0x00, 0x00, 0x00]));
    buf.push(0x80 | TV_ANTENNA_ID);
    buf.extend_from_slice(&[0x00, 0x02]);

    let params = parse_parameters(&buf).unwrap();
    assert_eq!(params.len(), 2);
    assert!(!params[0].tv);
    assert_eq!(params[0].param_type, PARAM_LLRP_STATUS);
    assert!(params[1].tv);
    assert_eq!(params[1].param_type, TV_ANTENNA_ID as u16);
    assert_eq!(params[1].value, vec![0x00, 0x02]);
  }

  #[test]
  fn rejects_truncated_tlv() {
    let mut buf = tlv(PARAM_LLRP_STATUS, &[0x00, 0x00, 0x00, 0x00]);
    buf.truncate(6);
    assert!(parse_parameters(&buf).is_err());
  }

  #[test]
  fn decodes_status_with_description() {
    let mut body = BytesMut::new();
    body.put_u16(0x011f);
    body.put_u16(7);
    body.extend_from_slice(b"invalid");

    let payload = tlv(PARAM_LLRP_STATUS, &body);
    let status = decode_status(&payload).unwrap();
    assert_eq!(status.status_code, 0x011f);
    assert_eq!(status.error_description, "invalid");
    assert!(!status.is_success());
  }

  #[test]
  fn missing_status_is_a_codec_error() {
    let payload = tlv(PARAM_TAG_REPORT_DATA, &[]);
    assert!(matches!(decode_status(&payload), Err(LlrpError::Codec { .. })));
  }

  #[test]
  fn decodes_connection_attempt_event() {
    let mut events = Vec::new();
    let mut ts = BytesMut::new();
    ts.put_u64(1_557_458_516_414_125);
    events.extend_from_slice(&tlv(PARAM_UTC_TIME_STAMP, &ts));
    events.extend_from_slice(&tlv(PARAM_CONNECTION_ATTEMPT_EVENT, &[0x00, 0x00]));
    let payload = tlv(PARAM_READER_EVENT_NOTIFICATION_DATA, &events);

    let data = ReaderEventNotificationData::decode(&payload).unwrap();
    assert_eq!(data.timestamp_us, Some(1_557_458_516_414_125));
    assert_eq!(data.connection_attempt, Some(0));
    assert!(data.is_success());
  }

  #[test]
  fn failed_connection_attempt_is_not_success() {
    let events = tlv(PARAM_CONNECTION_ATTEMPT_EVENT, &[0x00, 0x01]);
    let payload = tlv(PARAM_READER_EVENT_NOTIFICATION_DATA, &events);
    let data = ReaderEventNotificationData::decode(&payload).unwrap();
    assert!(!data.is_success());
  }

  #[test]
  fn decodes_tag_report_with_tv_fields() {
    let mut body = Vec::new();
    body.push(0x80 | TV_EPC_96);
    body.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]);
    body.push(0x80 | TV_PEAK_RSSI);
    body.push((-55i8) as u8);
    body.push(0x80 | TV_TAG_SEEN_COUNT);
    body.extend_from_slice(&[0x00, 0x03]);
    body.push(0x80 | TV_LAST_SEEN_TIMESTAMP_UTC);
    body.extend_from_slice(&1_700_000_000_000_000u64.to_be_bytes());

    let payload = tlv(PARAM_TAG_REPORT_DATA, &body);
    let report = RoAccessReport::decode(&payload).unwrap();

    assert_eq!(report.tags.len(), 1);
    let tag = &report.tags[0];
    assert_eq!(tag.epc[..4], [0xde, 0xad, 0xbe, 0xef]);
    assert_eq!(tag.peak_rssi, Some(-55));
    assert_eq!(tag.tag_seen_count, Some(3));
    assert_eq!(tag.last_seen_utc, Some(1_700_000_000_000_000));
  }

  #[test]
  fn decodes_variable_length_epc_data() {
    let mut epc = BytesMut::new();
    epc.put_u16(16);
    epc.extend_from_slice(&[0xab, 0xcd]);
    let body = tlv(PARAM_EPC_DATA, &epc);
    let payload = tlv(PARAM_TAG_REPORT_DATA, &body);

    let report = RoAccessReport::decode(&payload).unwrap();
    assert_eq!(report.tags[0].epc, vec![0xab, 0xcd]);
  }

  fn capabilities_payload() -> Vec<u8> {
    let mut gdc = BytesMut::new();
    gdc.put_u16(2);        // MaxNumberOfAntennaSupported
    gdc.put_u16(0);
    gdc.put_u32(25882);    // manufacturer
    gdc.put_u32(2001007);  // model
    gdc.put_u16(5);
    gdc.extend_from_slice(b"7.1.1");

    let mut power = BytesMut::new();
    power.put_u16(1);
    power.put_u16(3225);

    let mode_table = tlv(
      PARAM_C1G2_UHF_RF_MODE_TABLE,
      &tlv(PARAM_C1G2_UHF_RF_MODE_TABLE_ENTRY, &rf_mode_entry_body(1000, 2, 25000))
    );

    let mut band = Vec::new();
    band.extend_from_slice(&tlv(PARAM_TRANSMIT_POWER_LEVEL_TABLE_ENTRY, &power));
    band.extend_from_slice(&mode_table);

    let mut regulatory = BytesMut::new();
    regulatory.put_u16(840);
    regulatory.put_u16(1);
    regulatory.extend_from_slice(&tlv(PARAM_UHF_BAND_CAPABILITIES, &band));

    let mut payload = Vec::new();
    payload.extend_from_slice(&tlv(PARAM_LLRP_STATUS, &[0x00, 0x00, 0x00, 0x00]));
    payload.extend_from_slice(&tlv(PARAM_GENERAL_DEVICE_CAPABILITIES, &gdc));
    payload.extend_from_slice(&tlv(PARAM_REGULATORY_CAPABILITIES, &regulatory));
    payload
  }

  #[test]
  fn decodes_capabilities_tree() {
    let caps = ReaderCapabilities::decode(&capabilities_payload()).unwrap();

    assert!(caps.status.is_success());
    let general = caps.general.as_ref().unwrap();
    assert_eq!(general.max_number_of_antennas_supported, 2);
    assert_eq!(general.reader_firmware_version, "7.1.1");

    let band = caps.regulatory.as_ref().unwrap().uhf_band.as_ref().unwrap();
    assert_eq!(band.transmit_power_levels.len(), 1);
    assert_eq!(band.rf_mode_table.len(), 1);
    assert_eq!(band.rf_mode_table[0].m, 2);
    assert_eq!(band.rf_mode_table[0].max_tari, 25000);
  }

  #[test]
  fn power_table_keeps_zero_sentinel() {
    let caps = ReaderCapabilities::decode(&capabilities_payload()).unwrap();
    let band = caps.regulatory.unwrap().uhf_band.unwrap();
    let table = parse_power_table(&band);
    assert_eq!(table, vec![0.0, 32.25]);
  }

  #[test]
  fn tx_power_zero_selects_max() {
    let table = vec![0.0, 15.0, 32.25, 30.0];
    let (index, dbm) = select_tx_power(0, &table).unwrap();
    assert_eq!(index, 2);
    assert!((dbm - 32.25).abs() < 0.01);
  }

  #[test]
  fn tx_power_out_of_range_is_rejected() {
    let table = vec![0.0, 32.25];
    let err = select_tx_power(99, &table).unwrap_err();
    match err {
      LlrpError::InvalidTxPower { requested, min, max } => {
        assert_eq!(requested, 99);
        assert_eq!(min, 1);
        assert_eq!(max, 1);
      }
      other => panic!("unexpected error: {}", other)
    }
  }

  #[test]
  fn mode_search_requires_tari_only_when_requested() {
    let table = vec![
      RfModeTableEntry::decode(&rf_mode_entry_body(1000, 2, 25000)).unwrap(),
      RfModeTableEntry::decode(&rf_mode_entry_body(1001, 2, 12500)).unwrap()
    ];

    let chosen = select_mode(&table, Modulation::M4, 12500).unwrap();
    assert_eq!(chosen.mode_identifier, 1001);

    let chosen = select_mode(&table, Modulation::M4, 0).unwrap();
    assert_eq!(chosen.mode_identifier, 1000);

    // no M8 mode advertised: warn and fall back to the first entry
    let chosen = select_mode(&table, Modulation::M8, 0).unwrap();
    assert_eq!(chosen.mode_identifier, 1000);
  }

  #[test]
  fn antenna_validation_drops_invalid_and_rejects_empty() {
    assert_eq!(validate_antennas(&[1, 2, 9], 2).unwrap(), vec![1, 2]);
    assert!(matches!(
      validate_antennas(&[5, 9], 2),
      Err(LlrpError::CapabilityMismatch(_))
    ));
  }
}
