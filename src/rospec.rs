use bytes::{BytesMut, BufMut};

use crate::llrp::{
  AIR_PROTOCOL_EPC_GLOBAL_C1G2,
  PARAM_ACCESS_COMMAND,
  PARAM_ACCESS_REPORT_SPEC,
  PARAM_ACCESS_SPEC,
  PARAM_ACCESS_SPEC_STOP_TRIGGER,
  PARAM_AI_SPEC,
  PARAM_AI_SPEC_STOP_TRIGGER,
  PARAM_ANTENNA_CONFIGURATION,
  PARAM_C1G2_INVENTORY_COMMAND,
  PARAM_C1G2_LOCK,
  PARAM_C1G2_LOCK_PAYLOAD,
  PARAM_C1G2_READ,
  PARAM_C1G2_RF_CONTROL,
  PARAM_C1G2_SINGULATION_CONTROL,
  PARAM_C1G2_TAG_SPEC,
  PARAM_C1G2_TARGET_TAG,
  PARAM_C1G2_WRITE,
  PARAM_INVENTORY_PARAMETER_SPEC,
  PARAM_RF_TRANSMITTER,
  PARAM_RO_BOUNDARY_SPEC,
  PARAM_RO_REPORT_SPEC,
  PARAM_RO_SPEC,
  PARAM_RO_SPEC_START_TRIGGER,
  PARAM_RO_SPEC_STOP_TRIGGER,
  PARAM_TAG_REPORT_CONTENT_SELECTOR,
};

// ROSpecStartTrigger / ROSpecStopTrigger type codes.
const START_TRIGGER_IMMEDIATE : u8 = 1;
const STOP_TRIGGER_NULL       : u8 = 0;
const STOP_TRIGGER_DURATION   : u8 = 1;

// ROReportTrigger type codes.
const REPORT_TRIGGER_NONE         : u8 = 0;
const REPORT_TRIGGER_N_TAGS       : u8 = 2;
const REPORT_TRIGGER_N_MS         : u8 = 6;

/// Opens a TLV parameter, leaving a length placeholder to backpatch.
fn begin_tlv(buf: &mut BytesMut, param_type: u16) -> usize {
  let at = buf.len();
  buf.put_u16(param_type);
  buf.put_u16(0x0000);
  at
}

/// Closes a TLV opened with `begin_tlv`, fixing up the length field.
fn end_tlv(buf: &mut BytesMut, at: usize) {
  let length = (buf.len() - at) as u16;
  buf[at + 2..at + 4].copy_from_slice(&length.to_be_bytes());
}

/// Per-tag report fields requested from the reader. Encoded as single bits
/// of the TagReportContentSelector word, high bit first.
#[derive(Debug, Clone)]
pub struct TagContentSelector {

  pub enable_rospec_id                   : bool,
  pub enable_spec_index                  : bool,
  pub enable_inventory_parameter_spec_id : bool,
  pub enable_antenna_id                  : bool,
  pub enable_channel_index               : bool,
  pub enable_peak_rssi                   : bool,
  pub enable_first_seen_timestamp        : bool,
  pub enable_last_seen_timestamp         : bool,
  pub enable_tag_seen_count              : bool,
  pub enable_access_spec_id              : bool
}

impl Default for TagContentSelector {
  fn default() -> Self {
    TagContentSelector {
      enable_rospec_id                   : false,
      enable_spec_index                  : false,
      enable_inventory_parameter_spec_id : false,
      enable_antenna_id                  : true,
      enable_channel_index               : false,
      enable_peak_rssi                   : true,
      enable_first_seen_timestamp        : false,
      enable_last_seen_timestamp         : true,
      enable_tag_seen_count              : true,
      enable_access_spec_id              : false
    }
  }
}

impl TagContentSelector {

  pub fn bits(&self) -> u16 {
    let mut bits = 0u16;
    if self.enable_rospec_id                   { bits |= 1 << 15; }
    if self.enable_spec_index                  { bits |= 1 << 14; }
    if self.enable_inventory_parameter_spec_id { bits |= 1 << 13; }
    if self.enable_antenna_id                  { bits |= 1 << 12; }
    if self.enable_channel_index               { bits |= 1 << 11; }
    if self.enable_peak_rssi                   { bits |= 1 << 10; }
    if self.enable_first_seen_timestamp        { bits |= 1 << 9;  }
    if self.enable_last_seen_timestamp         { bits |= 1 << 8;  }
    if self.enable_tag_seen_count              { bits |= 1 << 7;  }
    if self.enable_access_spec_id              { bits |= 1 << 6;  }
    bits
  }
}

/// Everything needed to describe one inventory job. The builder is pure:
/// the same config always encodes to the same bytes.
#[derive(Debug, Clone)]
pub struct RoSpecConfig {

  pub rospec_id            : u32,
  pub priority             : u8,
  pub duration_sec         : Option<f32>,
  pub report_every_n_tags  : Option<u16>,
  pub report_timeout_ms    : u32,
  pub tx_power_index       : u16,
  pub antennas             : Vec<u16>,
  pub mode_index           : u16,
  pub tari                 : u16,
  pub session              : u8,
  pub tag_population       : u16,
  pub tag_content_selector : TagContentSelector
}

impl RoSpecConfig {

  /// Encodes the ROSpec parameter tree (the ADD_ROSPEC payload).
  pub fn encode(&self) -> Vec<u8> {
    let mut buf = BytesMut::new();

    let rospec = begin_tlv(&mut buf, PARAM_RO_SPEC);
    buf.put_u32(self.rospec_id);
    buf.put_u8(self.priority);
    buf.put_u8(0x00); // CurrentState: Disabled until ENABLE_ROSPEC

    {
      let boundary = begin_tlv(&mut buf, PARAM_RO_BOUNDARY_SPEC);

      let start = begin_tlv(&mut buf, PARAM_RO_SPEC_START_TRIGGER);
      buf.put_u8(START_TRIGGER_IMMEDIATE);
      end_tlv(&mut buf, start);

      let stop = begin_tlv(&mut buf, PARAM_RO_SPEC_STOP_TRIGGER);
      match self.duration_sec {
        Some(seconds) if seconds > 0.0 => {
          buf.put_u8(STOP_TRIGGER_DURATION);
          buf.put_u32((seconds * 1000.0) as u32);
        }
        _ => {
          buf.put_u8(STOP_TRIGGER_NULL);
          buf.put_u32(0);
        }
      }
      end_tlv(&mut buf, stop);

      end_tlv(&mut buf, boundary);
    }

    {
      let ai_spec = begin_tlv(&mut buf, PARAM_AI_SPEC);

      buf.put_u16(self.antennas.len() as u16);
      for antenna_id in &self.antennas {
        buf.put_u16(*antenna_id);
      }

      let stop = begin_tlv(&mut buf, PARAM_AI_SPEC_STOP_TRIGGER);
      buf.put_u8(STOP_TRIGGER_NULL); // stop when the ROSpec is done
      buf.put_u32(0);
      end_tlv(&mut buf, stop);

      let inventory = begin_tlv(&mut buf, PARAM_INVENTORY_PARAMETER_SPEC);
      buf.put_u16(1); // InventoryParameterSpecID
      buf.put_u8(AIR_PROTOCOL_EPC_GLOBAL_C1G2);

      for antenna_id in &self.antennas {
        let antenna = begin_tlv(&mut buf, PARAM_ANTENNA_CONFIGURATION);
        buf.put_u16(*antenna_id);

        let transmitter = begin_tlv(&mut buf, PARAM_RF_TRANSMITTER);
        buf.put_u16(1); // HopTableID
        buf.put_u16(1); // ChannelIndex
        buf.put_u16(self.tx_power_index);
        end_tlv(&mut buf, transmitter);

        let command = begin_tlv(&mut buf, PARAM_C1G2_INVENTORY_COMMAND);
        buf.put_u8(0x00); // TagInventoryStateAware: false

        let rf_control = begin_tlv(&mut buf, PARAM_C1G2_RF_CONTROL);
        buf.put_u16(self.mode_index);
        buf.put_u16(self.tari);
        end_tlv(&mut buf, rf_control);

        let singulation = begin_tlv(&mut buf, PARAM_C1G2_SINGULATION_CONTROL);
        buf.put_u8((self.session & 0x3) << 6);
        buf.put_u16(self.tag_population);
        buf.put_u32(0); // TagTransitTime
        end_tlv(&mut buf, singulation);

        end_tlv(&mut buf, command);
        end_tlv(&mut buf, antenna);
      }

      end_tlv(&mut buf, inventory);
      end_tlv(&mut buf, ai_spec);
    }

    {
      let report = begin_tlv(&mut buf, PARAM_RO_REPORT_SPEC);

      if self.report_timeout_ms > 0 {
        buf.put_u8(REPORT_TRIGGER_N_MS);
        buf.put_u16(self.report_timeout_ms as u16);
      } else if let Some(n) = self.report_every_n_tags {
        buf.put_u8(REPORT_TRIGGER_N_TAGS);
        buf.put_u16(n);
      } else {
        buf.put_u8(REPORT_TRIGGER_NONE);
        buf.put_u16(0);
      }

      let selector = begin_tlv(&mut buf, PARAM_TAG_REPORT_CONTENT_SELECTOR);
      buf.put_u16(self.tag_content_selector.bits());
      end_tlv(&mut buf, selector);

      end_tlv(&mut buf, report);
    }

    end_tlv(&mut buf, rospec);
    buf.to_vec()
  }
}

/// Tag filter for an AccessSpec. The all-zero default matches every tag.
#[derive(Debug, Clone, Default)]
pub struct TargetTag {

  pub mb             : u8,
  pub pointer        : u16,
  pub mask_bit_count : u16,
  pub mask           : Vec<u8>,
  pub data_bit_count : u16,
  pub data           : Vec<u8>
}

#[derive(Debug, Clone)]
pub struct ReadOpSpec {

  pub op_spec_id      : u16,
  pub access_password : u32,
  pub mb              : u8,
  pub word_ptr        : u16,
  pub word_count      : u16
}

#[derive(Debug, Clone)]
pub struct WriteOpSpec {

  pub op_spec_id      : u16,
  pub access_password : u32,
  pub mb              : u8,
  pub word_ptr        : u16,
  pub data            : Vec<u16>
}

#[derive(Debug, Clone)]
pub struct LockPayload {

  pub privilege  : u8,
  pub data_field : u8
}

#[derive(Debug, Clone)]
pub struct LockOpSpec {

  pub op_spec_id      : u16,
  pub access_password : u32,
  pub payloads        : Vec<LockPayload>
}

/// The single operation an AccessSpec performs against matching tags.
#[derive(Debug, Clone)]
pub enum AccessOp {
  Read(ReadOpSpec),
  Write(WriteOpSpec),
  Lock(LockOpSpec)
}

#[derive(Debug, Clone)]
pub struct AccessSpecConfig {

  pub access_spec_id  : u32,
  pub antenna_id      : u16, // 0 applies to all antennas
  pub rospec_id       : u32, // 0 applies to all ROSpecs
  pub target          : TargetTag,
  pub op              : AccessOp,
  pub operation_count : u16  // stop after this many operations; 0 = unlimited
}

impl AccessSpecConfig {

  /// Encodes the AccessSpec parameter tree (the ADD_ACCESSSPEC payload).
  pub fn encode(&self) -> Vec<u8> {
    let mut buf = BytesMut::new();

    let spec = begin_tlv(&mut buf, PARAM_ACCESS_SPEC);
    buf.put_u32(self.access_spec_id);
    buf.put_u16(self.antenna_id);
    buf.put_u8(AIR_PROTOCOL_EPC_GLOBAL_C1G2);
    buf.put_u8(0x00); // CurrentState: disabled until ENABLE_ACCESSSPEC
    buf.put_u32(self.rospec_id);

    {
      let stop = begin_tlv(&mut buf, PARAM_ACCESS_SPEC_STOP_TRIGGER);
      if self.operation_count > 0 {
        buf.put_u8(1); // operation-count trigger
        buf.put_u16(self.operation_count);
      } else {
        buf.put_u8(0);
        buf.put_u16(0);
      }
      end_tlv(&mut buf, stop);
    }

    {
      let command = begin_tlv(&mut buf, PARAM_ACCESS_COMMAND);

      let tag_spec = begin_tlv(&mut buf, PARAM_C1G2_TAG_SPEC);
      let target = begin_tlv(&mut buf, PARAM_C1G2_TARGET_TAG);
      buf.put_u8(((self.target.mb & 0x3) << 6) | 0x20); // Match = 1
      buf.put_u16(self.target.pointer);
      buf.put_u16(self.target.mask_bit_count);
      buf.extend_from_slice(&self.target.mask);
      buf.put_u16(self.target.data_bit_count);
      buf.extend_from_slice(&self.target.data);
      end_tlv(&mut buf, target);
      end_tlv(&mut buf, tag_spec);

      match &self.op {

        AccessOp::Read(read) => {
          let op = begin_tlv(&mut buf, PARAM_C1G2_READ);
          buf.put_u16(read.op_spec_id);
          buf.put_u32(read.access_password);
          buf.put_u8((read.mb & 0x3) << 6);
          buf.put_u16(read.word_ptr);
          buf.put_u16(read.word_count);
          end_tlv(&mut buf, op);
        }

        AccessOp::Write(write) => {
          let op = begin_tlv(&mut buf, PARAM_C1G2_WRITE);
          buf.put_u16(write.op_spec_id);
          buf.put_u32(write.access_password);
          buf.put_u8((write.mb & 0x3) << 6);
          buf.put_u16(write.word_ptr);
          buf.put_u16(write.data.len() as u16);
          for word in &write.data {
            buf.put_u16(*word);
          }
          end_tlv(&mut buf, op);
        }

        AccessOp::Lock(lock) => {
          let op = begin_tlv(&mut buf, PARAM_C1G2_LOCK);
          buf.put_u16(lock.op_spec_id);
          buf.put_u32(lock.access_password);
          for payload in &lock.payloads {
            let p = begin_tlv(&mut buf, PARAM_C1G2_LOCK_PAYLOAD);
            buf.put_u8(payload.privilege);
            buf.put_u8(payload.data_field);
            end_tlv(&mut buf, p);
          }
          end_tlv(&mut buf, op);
        }
      }

      end_tlv(&mut buf, command);
    }

    {
      let report = begin_tlv(&mut buf, PARAM_ACCESS_REPORT_SPEC);
      buf.put_u8(1); // report at the end of the access operation
      end_tlv(&mut buf, report);
    }

    end_tlv(&mut buf, spec);
    buf.to_vec()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::params::parse_parameters;

  fn config() -> RoSpecConfig {
    RoSpecConfig {
      rospec_id            : 1,
      priority             : 0,
      duration_sec         : None,
      report_every_n_tags  : Some(1),
      report_timeout_ms    : 0,
      tx_power_index       : 1,
      antennas             : vec![1, 2],
      mode_index           : 1000,
      tari                 : 25000,
      session              : 2,
      tag_population       : 4,
      tag_content_selector : TagContentSelector::default()
    }
  }

  #[test]
  fn builder_is_deterministic() {
    assert_eq!(config().encode(), config().encode());
  }

  #[test]
  fn rospec_tree_reparses() {
    let encoded = config().encode();

    let top = parse_parameters(&encoded).unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].param_type, PARAM_RO_SPEC);

    let body = &top[0].value;
    assert_eq!(&body[..4], &1u32.to_be_bytes());
    assert_eq!(body[4], 0); // priority
    assert_eq!(body[5], 0); // disabled

    let children = parse_parameters(&body[6..]).unwrap();
    let types: Vec<u16> = children.iter().map(|p| p.param_type).collect();
    assert_eq!(types, vec![PARAM_RO_BOUNDARY_SPEC, PARAM_AI_SPEC, PARAM_RO_REPORT_SPEC]);
  }

  #[test]
  fn ai_spec_lists_antennas_and_per_antenna_configuration() {
    let encoded = config().encode();
    let top = parse_parameters(&encoded).unwrap();
    let children = parse_parameters(&top[0].value[6..]).unwrap();

    let ai_spec = children.iter().find(|p| p.param_type == PARAM_AI_SPEC).unwrap();
    let body = &ai_spec.value;

    assert_eq!(&body[..2], &2u16.to_be_bytes());
    assert_eq!(&body[2..4], &1u16.to_be_bytes());
    assert_eq!(&body[4..6], &2u16.to_be_bytes());

    let nested = parse_parameters(&body[6..]).unwrap();
    let inventory = nested.iter()
      .find(|p| p.param_type == PARAM_INVENTORY_PARAMETER_SPEC)
      .unwrap();

    let configs = parse_parameters(&inventory.value[3..]).unwrap();
    assert_eq!(configs.len(), 2);
    assert!(configs.iter().all(|p| p.param_type == PARAM_ANTENNA_CONFIGURATION));

    // RFTransmitter carries the negotiated power index
    let antenna_body = &configs[0].value;
    let inner = parse_parameters(&antenna_body[2..]).unwrap();
    let transmitter = inner.iter().find(|p| p.param_type == PARAM_RF_TRANSMITTER).unwrap();
    assert_eq!(&transmitter.value[4..6], &1u16.to_be_bytes());
  }

  #[test]
  fn report_spec_prefers_timeout_over_tag_count() {
    let mut cfg = config();
    cfg.report_timeout_ms = 250;

    let encoded = cfg.encode();
    let top = parse_parameters(&encoded).unwrap();
    let children = parse_parameters(&top[0].value[6..]).unwrap();
    let report = children.iter().find(|p| p.param_type == PARAM_RO_REPORT_SPEC).unwrap();

    assert_eq!(report.value[0], REPORT_TRIGGER_N_MS);
    assert_eq!(&report.value[1..3], &250u16.to_be_bytes());
  }

  #[test]
  fn selector_bits_follow_the_wire_layout() {
    let selector = TagContentSelector::default();
    // antenna id, peak rssi, last seen, tag count
    assert_eq!(selector.bits(), (1 << 12) | (1 << 10) | (1 << 8) | (1 << 7));

    let all_off = TagContentSelector {
      enable_rospec_id                   : false,
      enable_spec_index                  : false,
      enable_inventory_parameter_spec_id : false,
      enable_antenna_id                  : false,
      enable_channel_index               : false,
      enable_peak_rssi                   : false,
      enable_first_seen_timestamp        : false,
      enable_last_seen_timestamp         : false,
      enable_tag_seen_count              : false,
      enable_access_spec_id              : false
    };
    assert_eq!(all_off.bits(), 0);
  }

  #[test]
  fn duration_sets_reader_side_stop_trigger() {
    let mut cfg = config();
    cfg.duration_sec = Some(0.5);

    let encoded = cfg.encode();
    let top = parse_parameters(&encoded).unwrap();
    let children = parse_parameters(&top[0].value[6..]).unwrap();
    let boundary = children.iter().find(|p| p.param_type == PARAM_RO_BOUNDARY_SPEC).unwrap();

    let triggers = parse_parameters(&boundary.value).unwrap();
    let stop = triggers.iter().find(|p| p.param_type == PARAM_RO_SPEC_STOP_TRIGGER).unwrap();
    assert_eq!(stop.value[0], STOP_TRIGGER_DURATION);
    assert_eq!(&stop.value[1..5], &500u32.to_be_bytes());
  }

  #[test]
  fn access_spec_tree_reparses() {
    let cfg = AccessSpecConfig {
      access_spec_id  : 1,
      antenna_id      : 0,
      rospec_id       : 0,
      target          : TargetTag::default(),
      op              : AccessOp::Read(ReadOpSpec {
        op_spec_id      : 0,
        access_password : 0,
        mb              : 1,
        word_ptr        : 2,
        word_count      : 6
      }),
      operation_count : 5
    };

    let encoded = cfg.encode();
    let top = parse_parameters(&encoded).unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].param_type, PARAM_ACCESS_SPEC);

    let body = &top[0].value;
    assert_eq!(&body[..4], &1u32.to_be_bytes());
    assert_eq!(body[6], AIR_PROTOCOL_EPC_GLOBAL_C1G2);

    let children = parse_parameters(&body[12..]).unwrap();
    let types: Vec<u16> = children.iter().map(|p| p.param_type).collect();
    assert_eq!(types, vec![
      PARAM_ACCESS_SPEC_STOP_TRIGGER,
      PARAM_ACCESS_COMMAND,
      PARAM_ACCESS_REPORT_SPEC
    ]);

    let command = children.iter().find(|p| p.param_type == PARAM_ACCESS_COMMAND).unwrap();
    let ops = parse_parameters(&command.value).unwrap();
    assert_eq!(ops[0].param_type, PARAM_C1G2_TAG_SPEC);
    assert_eq!(ops[1].param_type, PARAM_C1G2_READ);
    assert_eq!(&ops[1].value[7..9], &2u16.to_be_bytes());
  }

  #[test]
  fn lock_op_encodes_one_payload_per_field() {
    let cfg = AccessSpecConfig {
      access_spec_id  : 2,
      antenna_id      : 0,
      rospec_id       : 0,
      target          : TargetTag::default(),
      op              : AccessOp::Lock(LockOpSpec {
        op_spec_id      : 1,
        access_password : 0,
        payloads        : vec![
          LockPayload { privilege: 1, data_field: 0 },
          LockPayload { privilege: 2, data_field: 4 }
        ]
      }),
      operation_count : 1
    };

    let encoded = cfg.encode();
    let top = parse_parameters(&encoded).unwrap();
    let children = parse_parameters(&top[0].value[12..]).unwrap();
    let command = children.iter().find(|p| p.param_type == PARAM_ACCESS_COMMAND).unwrap();

    let ops = parse_parameters(&command.value).unwrap();
    assert_eq!(ops[1].param_type, PARAM_C1G2_LOCK);

    let payloads = parse_parameters(&ops[1].value[6..]).unwrap();
    assert_eq!(payloads.len(), 2);
    assert!(payloads.iter().all(|p| p.param_type == PARAM_C1G2_LOCK_PAYLOAD));
    assert_eq!(payloads[1].value, vec![2, 4]);
  }
}
