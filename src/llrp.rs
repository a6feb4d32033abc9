use std::collections::HashMap;

use bytes::{BytesMut, Buf, BufMut};
use log::warn;
use once_cell::sync::Lazy;
use strum_macros::{Display, EnumString};

use crate::error::LlrpError;

/// Default TCP port for LLRP readers (IANA-assigned).
pub const LLRP_PORT: u16 = 5084;

/// Fixed LLRP frame header: {rsvd:3 | ver:3 | type:10 | length:32 | id:32}.
pub const LLRP_HEADER_LEN: usize = 10;

/// Upper bound on a single frame; anything larger is a framing error.
pub const MAX_FRAME_LEN: usize = 1 << 20;

// Message type constants for LLRP operations.
// Used to define various types of LLRP messages and their responses.
pub const TYPE_GET_READER_CAPABILITIES          : u16 = 1;
pub const TYPE_GET_READER_CAPABILITIES_RESPONSE : u16 = 11;
pub const TYPE_CLOSE_CONNECTION                 : u16 = 14;
pub const TYPE_CLOSE_CONNECTION_RESPONSE        : u16 = 4;
pub const TYPE_ADD_ROSPEC                       : u16 = 20;
pub const TYPE_ADD_ROSPEC_RESPONSE              : u16 = 30;
pub const TYPE_DELETE_ROSPEC                    : u16 = 21;
pub const TYPE_DELETE_ROSPEC_RESPONSE           : u16 = 31;
pub const TYPE_ENABLE_ROSPEC                    : u16 = 24;
pub const TYPE_ENABLE_ROSPEC_RESPONSE           : u16 = 34;
pub const TYPE_DISABLE_ROSPEC                   : u16 = 25;
pub const TYPE_DISABLE_ROSPEC_RESPONSE          : u16 = 35;
pub const TYPE_ADD_ACCESSSPEC                   : u16 = 40;
pub const TYPE_ADD_ACCESSSPEC_RESPONSE          : u16 = 50;
pub const TYPE_DELETE_ACCESSSPEC                : u16 = 41;
pub const TYPE_DELETE_ACCESSSPEC_RESPONSE       : u16 = 51;
pub const TYPE_ENABLE_ACCESSSPEC                : u16 = 42;
pub const TYPE_ENABLE_ACCESSSPEC_RESPONSE       : u16 = 52;
pub const TYPE_DISABLE_ACCESSSPEC               : u16 = 43;
pub const TYPE_DISABLE_ACCESSSPEC_RESPONSE      : u16 = 53;
pub const TYPE_RO_ACCESS_REPORT                 : u16 = 61;
pub const TYPE_KEEPALIVE                        : u16 = 62;
pub const TYPE_KEEPALIVE_ACK                    : u16 = 72;
pub const TYPE_READER_EVENT_NOTIFICATION        : u16 = 63;
pub const TYPE_ERROR_MESSAGE                    : u16 = 100;

// TLV parameter type constants used in the messages above.
pub const PARAM_UTC_TIME_STAMP                   : u16 = 128;
pub const PARAM_GENERAL_DEVICE_CAPABILITIES      : u16 = 137;
pub const PARAM_RECEIVE_SENSITIVITY_TABLE_ENTRY  : u16 = 139;
pub const PARAM_PER_ANTENNA_AIR_PROTOCOL         : u16 = 140;
pub const PARAM_GPIO_CAPABILITIES                : u16 = 141;
pub const PARAM_LLRP_CAPABILITIES                : u16 = 142;
pub const PARAM_REGULATORY_CAPABILITIES          : u16 = 143;
pub const PARAM_UHF_BAND_CAPABILITIES            : u16 = 144;
pub const PARAM_TRANSMIT_POWER_LEVEL_TABLE_ENTRY : u16 = 145;
pub const PARAM_FREQUENCY_INFORMATION            : u16 = 146;
pub const PARAM_FREQUENCY_HOP_TABLE              : u16 = 147;
pub const PARAM_FIXED_FREQUENCY_TABLE            : u16 = 148;
pub const PARAM_RO_SPEC                          : u16 = 177;
pub const PARAM_RO_BOUNDARY_SPEC                 : u16 = 178;
pub const PARAM_RO_SPEC_START_TRIGGER            : u16 = 179;
pub const PARAM_RO_SPEC_STOP_TRIGGER             : u16 = 182;
pub const PARAM_AI_SPEC                          : u16 = 183;
pub const PARAM_AI_SPEC_STOP_TRIGGER             : u16 = 184;
pub const PARAM_INVENTORY_PARAMETER_SPEC         : u16 = 186;
pub const PARAM_ACCESS_SPEC                      : u16 = 207;
pub const PARAM_ACCESS_SPEC_STOP_TRIGGER         : u16 = 208;
pub const PARAM_ACCESS_COMMAND                   : u16 = 209;
pub const PARAM_ANTENNA_CONFIGURATION            : u16 = 222;
pub const PARAM_RF_TRANSMITTER                   : u16 = 224;
pub const PARAM_RO_REPORT_SPEC                   : u16 = 237;
pub const PARAM_TAG_REPORT_CONTENT_SELECTOR      : u16 = 238;
pub const PARAM_ACCESS_REPORT_SPEC               : u16 = 239;
pub const PARAM_TAG_REPORT_DATA                  : u16 = 240;
pub const PARAM_EPC_DATA                         : u16 = 241;
pub const PARAM_READER_EVENT_NOTIFICATION_DATA   : u16 = 246;
pub const PARAM_ANTENNA_EVENT                    : u16 = 255;
pub const PARAM_CONNECTION_ATTEMPT_EVENT         : u16 = 256;
pub const PARAM_CONNECTION_CLOSE_EVENT           : u16 = 257;
pub const PARAM_LLRP_STATUS                      : u16 = 287;
pub const PARAM_FIELD_ERROR                      : u16 = 288;
pub const PARAM_PARAMETER_ERROR                  : u16 = 289;
pub const PARAM_C1G2_LLRP_CAPABILITIES           : u16 = 327;
pub const PARAM_C1G2_UHF_RF_MODE_TABLE           : u16 = 328;
pub const PARAM_C1G2_UHF_RF_MODE_TABLE_ENTRY     : u16 = 329;
pub const PARAM_C1G2_INVENTORY_COMMAND           : u16 = 330;
pub const PARAM_C1G2_RF_CONTROL                  : u16 = 335;
pub const PARAM_C1G2_SINGULATION_CONTROL         : u16 = 336;
pub const PARAM_C1G2_TAG_SPEC                    : u16 = 338;
pub const PARAM_C1G2_TARGET_TAG                  : u16 = 339;
pub const PARAM_C1G2_READ                        : u16 = 341;
pub const PARAM_C1G2_WRITE                       : u16 = 342;
pub const PARAM_C1G2_LOCK                        : u16 = 344;
pub const PARAM_C1G2_LOCK_PAYLOAD                : u16 = 345;

// TV (type-value) parameter types: high bit set on the wire, fixed lengths.
pub const TV_ANTENNA_ID                  : u8 = 1;
pub const TV_FIRST_SEEN_TIMESTAMP_UTC    : u8 = 2;
pub const TV_FIRST_SEEN_TIMESTAMP_UPTIME : u8 = 3;
pub const TV_LAST_SEEN_TIMESTAMP_UTC     : u8 = 4;
pub const TV_LAST_SEEN_TIMESTAMP_UPTIME  : u8 = 5;
pub const TV_PEAK_RSSI                   : u8 = 6;
pub const TV_CHANNEL_INDEX               : u8 = 7;
pub const TV_TAG_SEEN_COUNT              : u8 = 8;
pub const TV_RO_SPEC_ID                  : u8 = 9;
pub const TV_INVENTORY_PARAMETER_SPEC_ID : u8 = 10;
pub const TV_C1G2_CRC                    : u8 = 11;
pub const TV_C1G2_PC                     : u8 = 12;
pub const TV_EPC_96                      : u8 = 13;
pub const TV_SPEC_INDEX                  : u8 = 14;
pub const TV_ACCESS_SPEC_ID              : u8 = 16;
pub const TV_OP_SPEC_ID                  : u8 = 17;

/// `RequestedData` codes for GET_READER_CAPABILITIES.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedCapability {
  All                         = 0,
  GeneralDeviceCapabilities   = 1,
  LlrpCapabilities            = 2,
  RegulatoryCapabilities      = 3,
  AirProtocolLlrpCapabilities = 4
}

/// Air protocol identifier for EPCglobal Class-1 Gen-2.
pub const AIR_PROTOCOL_EPC_GLOBAL_C1G2: u8 = 1;

/// Reader-to-tag link modulations ("M" value of a UHF RF mode table entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum Modulation {
  FM0,
  M2,
  M4,
  M8
}

pub const DEFAULT_MODULATION: Modulation = Modulation::M4;

impl Modulation {

  /// The M value carried in C1G2UHFRFModeTableEntry.
  pub fn type_code(self) -> u8 {
    match self {
      Modulation::FM0 => 0,
      Modulation::M2  => 1,
      Modulation::M4  => 2,
      Modulation::M8  => 3
    }
  }

  /// Recommended Tari (ns) when the caller did not request one.
  pub fn default_tari(self) -> u32 {
    match self {
      Modulation::FM0 => 18880,
      Modulation::M2  => 12500,
      Modulation::M4  => 25000,
      Modulation::M8  => 25000
    }
  }
}

static MESSAGE_TYPE2NAME: Lazy<HashMap<u16, &'static str>> = Lazy::new(|| {
  HashMap::from([
    (TYPE_GET_READER_CAPABILITIES,          "GET_READER_CAPABILITIES"),
    (TYPE_GET_READER_CAPABILITIES_RESPONSE, "GET_READER_CAPABILITIES_RESPONSE"),
    (TYPE_CLOSE_CONNECTION,                 "CLOSE_CONNECTION"),
    (TYPE_CLOSE_CONNECTION_RESPONSE,        "CLOSE_CONNECTION_RESPONSE"),
    (TYPE_ADD_ROSPEC,                       "ADD_ROSPEC"),
    (TYPE_ADD_ROSPEC_RESPONSE,              "ADD_ROSPEC_RESPONSE"),
    (TYPE_DELETE_ROSPEC,                    "DELETE_ROSPEC"),
    (TYPE_DELETE_ROSPEC_RESPONSE,           "DELETE_ROSPEC_RESPONSE"),
    (TYPE_ENABLE_ROSPEC,                    "ENABLE_ROSPEC"),
    (TYPE_ENABLE_ROSPEC_RESPONSE,           "ENABLE_ROSPEC_RESPONSE"),
    (TYPE_DISABLE_ROSPEC,                   "DISABLE_ROSPEC"),
    (TYPE_DISABLE_ROSPEC_RESPONSE,          "DISABLE_ROSPEC_RESPONSE"),
    (TYPE_ADD_ACCESSSPEC,                   "ADD_ACCESSSPEC"),
    (TYPE_ADD_ACCESSSPEC_RESPONSE,          "ADD_ACCESSSPEC_RESPONSE"),
    (TYPE_DELETE_ACCESSSPEC,                "DELETE_ACCESSSPEC"),
    (TYPE_DELETE_ACCESSSPEC_RESPONSE,       "DELETE_ACCESSSPEC_RESPONSE"),
    (TYPE_ENABLE_ACCESSSPEC,                "ENABLE_ACCESSSPEC"),
    (TYPE_ENABLE_ACCESSSPEC_RESPONSE,       "ENABLE_ACCESSSPEC_RESPONSE"),
    (TYPE_DISABLE_ACCESSSPEC,               "DISABLE_ACCESSSPEC"),
    (TYPE_DISABLE_ACCESSSPEC_RESPONSE,      "DISABLE_ACCESSSPEC_RESPONSE"),
    (TYPE_RO_ACCESS_REPORT,                 "RO_ACCESS_REPORT"),
    (TYPE_KEEPALIVE,                        "KEEPALIVE"),
    (TYPE_KEEPALIVE_ACK,                    "KEEPALIVE_ACK"),
    (TYPE_READER_EVENT_NOTIFICATION,        "READER_EVENT_NOTIFICATION"),
    (TYPE_ERROR_MESSAGE,                    "ERROR_MESSAGE")
  ])
});

static MESSAGE_NAME2TYPE: Lazy<HashMap<&'static str, u16>> = Lazy::new(|| {
  MESSAGE_TYPE2NAME.iter().map(|(ty, name)| (*name, *ty)).collect()
});

/// Name of a message type, if it is one the client understands.
pub fn message_name(message_type: u16) -> Option<&'static str> {
  MESSAGE_TYPE2NAME.get(&message_type).copied()
}

/// Type code for a message name.
pub fn message_type(name: &str) -> Result<u16, LlrpError> {
  MESSAGE_NAME2TYPE
    .get(name)
    .copied()
    .ok_or_else(|| LlrpError::UnknownMessageName(name.to_string()))
}

/// Represents an LLRP-compliant message.
///
/// This struct encapsulates the core components of an LLRP message:
/// protocol version, 10-bit type code, correlation ID, and the binary
/// payload (the encoded parameter list).
#[derive(Debug, Clone)]
pub struct LlrpMessage {

  pub ver          : u8,
  pub message_type : u16,
  pub message_id   : u32,
  pub payload      : Vec<u8>
}

impl LlrpMessage {

  pub fn new(message_type: u16, message_id: u32, payload: Vec<u8>) -> Self {
    LlrpMessage {
      ver: 1,
      message_type,
      message_id,
      payload
    }
  }

  pub fn name(&self) -> Option<&'static str> {
    message_name(self.message_type)
  }

  pub fn new_get_reader_capabilities(message_id: u32, requested: RequestedCapability) -> Self {
    LlrpMessage::new(TYPE_GET_READER_CAPABILITIES, message_id, vec![requested as u8])
  }

  pub fn new_add_rospec(message_id: u32, rospec: Vec<u8>) -> Self {
    LlrpMessage::new(TYPE_ADD_ROSPEC, message_id, rospec)
  }

  pub fn new_enable_rospec(message_id: u32, rospec_id: u32) -> Self {
    LlrpMessage::new(TYPE_ENABLE_ROSPEC, message_id, rospec_id.to_be_bytes().to_vec())
  }

  pub fn new_disable_rospec(message_id: u32, rospec_id: u32) -> Self {
    LlrpMessage::new(TYPE_DISABLE_ROSPEC, message_id, rospec_id.to_be_bytes().to_vec())
  }

  pub fn new_delete_rospec(message_id: u32, rospec_id: u32) -> Self {
    LlrpMessage::new(TYPE_DELETE_ROSPEC, message_id, rospec_id.to_be_bytes().to_vec())
  }

  pub fn new_add_accessspec(message_id: u32, accessspec: Vec<u8>) -> Self {
    LlrpMessage::new(TYPE_ADD_ACCESSSPEC, message_id, accessspec)
  }

  pub fn new_enable_accessspec(message_id: u32, accessspec_id: u32) -> Self {
    LlrpMessage::new(TYPE_ENABLE_ACCESSSPEC, message_id, accessspec_id.to_be_bytes().to_vec())
  }

  pub fn new_disable_accessspec(message_id: u32, accessspec_id: u32) -> Self {
    LlrpMessage::new(TYPE_DISABLE_ACCESSSPEC, message_id, accessspec_id.to_be_bytes().to_vec())
  }

  pub fn new_delete_accessspec(message_id: u32, accessspec_id: u32) -> Self {
    LlrpMessage::new(TYPE_DELETE_ACCESSSPEC, message_id, accessspec_id.to_be_bytes().to_vec())
  }

  pub fn new_keepalive_ack(message_id: u32) -> Self {
    LlrpMessage::new(TYPE_KEEPALIVE_ACK, message_id, vec![])
  }

  pub fn new_close_connection(message_id: u32) -> Self {
    LlrpMessage::new(TYPE_CLOSE_CONNECTION, message_id, vec![])
  }

  /// Encodes the message into a wire frame, header included.
  pub fn encode(&self) -> BytesMut {
    let length = (LLRP_HEADER_LEN + self.payload.len()) as u32;
    let mut buffer = BytesMut::with_capacity(length as usize);

    let prefix = ((self.ver as u16 & 0x7) << 10) | (self.message_type & 0x3FF);
    buffer.put_u16(prefix);
    buffer.put_u32(length);
    buffer.put_u32(self.message_id);
    buffer.extend_from_slice(&self.payload);

    buffer
  }

  /// Decodes one complete wire frame, header included.
  ///
  /// The caller (normally `FrameParser`) guarantees `buf` holds exactly one
  /// frame. An unrecognized type code is rejected here so that the frame is
  /// consumed but never dispatched.
  pub fn decode(mut buf: BytesMut) -> Result<Self, LlrpError> {
    if buf.len() < LLRP_HEADER_LEN {
      return Err(LlrpError::Framing(format!(
        "frame of {} bytes is shorter than the LLRP header", buf.len()
      )));
    }

    let prefix = buf.get_u16();
    if prefix >> 13 != 0 {
      warn!("nonzero reserved bits in LLRP header: {:#06x}", prefix);
    }

    let ver = ((prefix >> 10) & 0x7) as u8;
    let message_type = prefix & 0x3FF;

    let length = buf.get_u32() as usize;
    if length < LLRP_HEADER_LEN || buf.remaining() < length - 6 {
      return Err(LlrpError::Framing(format!(
        "frame length field {} inconsistent with {} buffered bytes", length, buf.remaining() + 6
      )));
    }

    let message_id = buf.get_u32();
    let payload = buf.split_to(length - LLRP_HEADER_LEN).to_vec();

    if message_name(message_type).is_none() {
      return Err(LlrpError::UnknownMessageType(message_type));
    }

    Ok(LlrpMessage {
      ver,
      message_type,
      message_id,
      payload
    })
  }
}

/// Reassembles length-prefixed LLRP frames from a TCP byte stream.
///
/// The connection task reads into `buffer_mut()` and then drains complete
/// frames with `next_frame()`. Partial frames stay buffered until the next
/// read; after a drain round the buffer never holds a complete frame.
#[derive(Debug, Default)]
pub struct FrameParser {
  buf: BytesMut
}

impl FrameParser {

  pub fn new() -> Self {
    FrameParser { buf: BytesMut::with_capacity(4096) }
  }

  pub fn buffer_mut(&mut self) -> &mut BytesMut {
    &mut self.buf
  }

  /// Bytes currently buffered (a strict prefix of the next frame).
  pub fn pending(&self) -> usize {
    self.buf.len()
  }

  pub fn next_frame(&mut self) -> Result<Option<LlrpMessage>, LlrpError> {
    if self.buf.len() < LLRP_HEADER_LEN {
      return Ok(None);
    }

    let length = u32::from_be_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]) as usize;

    if length < LLRP_HEADER_LEN {
      return Err(LlrpError::Framing(format!(
        "frame length field {} is shorter than the header", length
      )));
    }

    if length > MAX_FRAME_LEN {
      return Err(LlrpError::Framing(format!(
        "frame length field {} exceeds the {} byte limit", length, MAX_FRAME_LEN
      )));
    }

    if self.buf.len() < length {
      return Ok(None);
    }

    let frame = self.buf.split_to(length);
    LlrpMessage::decode(frame).map(Some)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn header_round_trip() {
    let msg = LlrpMessage::new(TYPE_ADD_ROSPEC, 1001, vec![0xde, 0xad, 0xbe, 0xef]);
    let frame = msg.encode();

    assert_eq!(frame.len(), 14);
    assert_eq!(&frame[..2], &[0x04, 0x14]);

    let decoded = LlrpMessage::decode(frame).unwrap();
    assert_eq!(decoded.ver, 1);
    assert_eq!(decoded.message_type, TYPE_ADD_ROSPEC);
    assert_eq!(decoded.message_id, 1001);
    assert_eq!(decoded.payload, vec![0xde, 0xad, 0xbe, 0xef]);
  }

  #[test]
  fn keepalive_ack_frame_layout() {
    let frame = LlrpMessage::new_keepalive_ack(0).encode();
    assert_eq!(&frame[..], &[0x04, 0x48, 0x00, 0x00, 0x00, 0x0a, 0x00, 0x00, 0x00, 0x00]);
  }

  #[test]
  fn frame_parser_reassembles_partial_reads() {
    let frame = LlrpMessage::new_enable_rospec(7, 1).encode();
    let mut parser = FrameParser::new();

    parser.buffer_mut().extend_from_slice(&frame[..4]);
    assert!(parser.next_frame().unwrap().is_none());

    parser.buffer_mut().extend_from_slice(&frame[4..8]);
    assert!(parser.next_frame().unwrap().is_none());

    parser.buffer_mut().extend_from_slice(&frame[8..]);
    let msg = parser.next_frame().unwrap().unwrap();
    assert_eq!(msg.message_type, TYPE_ENABLE_ROSPEC);
    assert_eq!(msg.message_id, 7);
    assert_eq!(msg.payload, 1u32.to_be_bytes().to_vec());

    assert_eq!(parser.pending(), 0);
    assert!(parser.next_frame().unwrap().is_none());
  }

  #[test]
  fn frame_parser_drains_back_to_back_frames() {
    let mut parser = FrameParser::new();
    parser.buffer_mut().extend_from_slice(&LlrpMessage::new_keepalive_ack(1).encode());
    parser.buffer_mut().extend_from_slice(&LlrpMessage::new_delete_rospec(2, 0).encode());

    let first = parser.next_frame().unwrap().unwrap();
    let second = parser.next_frame().unwrap().unwrap();
    assert_eq!(first.message_type, TYPE_KEEPALIVE_ACK);
    assert_eq!(second.message_type, TYPE_DELETE_ROSPEC);
    assert_eq!(parser.pending(), 0);
  }

  #[test]
  fn frame_parser_rejects_short_length_field() {
    let mut parser = FrameParser::new();
    parser.buffer_mut().extend_from_slice(&[0x04, 0x3e, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00]);
    assert!(matches!(parser.next_frame(), Err(LlrpError::Framing(_))));
  }

  #[test]
  fn frame_parser_rejects_oversized_length_field() {
    let mut parser = FrameParser::new();
    parser.buffer_mut().extend_from_slice(&[0x04, 0x3e, 0xff, 0xff, 0xff, 0xff, 0x00, 0x00, 0x00, 0x00]);
    assert!(matches!(parser.next_frame(), Err(LlrpError::Framing(_))));
  }

  #[test]
  fn decode_rejects_unknown_type() {
    let frame = LlrpMessage::new(200, 0, vec![]).encode();
    let err = LlrpMessage::decode(frame).unwrap_err();
    assert!(matches!(err, LlrpError::UnknownMessageType(200)));
  }

  #[test]
  fn message_maps_are_bidirectional() {
    for (ty, name) in MESSAGE_TYPE2NAME.iter() {
      assert_eq!(message_type(name).unwrap(), *ty);
    }
    assert!(message_type("GET_ROSPECS").is_err());
  }

  #[test]
  fn modulation_names_parse() {
    assert_eq!("M4".parse::<Modulation>().unwrap(), Modulation::M4);
    assert_eq!(Modulation::FM0.type_code(), 0);
    assert_eq!(DEFAULT_MODULATION.to_string(), "M4");
  }
}
