use thiserror::Error;

/// Errors surfaced by the LLRP client library.
///
/// Framing errors are fatal for the connection; codec errors drop the
/// offending frame and keep the connection alive.
#[derive(Debug, Error)]
pub enum LlrpError {

  #[error("framing error: {0}")]
  Framing(String),

  #[error("unknown message type {0}")]
  UnknownMessageType(u16),

  #[error("unknown message name {0}")]
  UnknownMessageName(String),

  #[error("malformed {parameter} parameter: {reason}")]
  Codec {
    parameter : &'static str,
    reason    : String
  },

  #[error("capability mismatch: {0}")]
  CapabilityMismatch(String),

  #[error("invalid tx_power: requested={requested}, min_available={min}, max_available={max}")]
  InvalidTxPower {
    requested : u16,
    min       : u16,
    max       : u16
  },

  #[error("{message} failed with status {status_code}: {description}")]
  ProtocolStatus {
    message     : &'static str,
    status_code : u16,
    description : String
  },

  #[error("timed out connecting to reader")]
  ConnectTimeout,

  #[error("connection to reader lost")]
  ConnectionLost,

  #[error(transparent)]
  Io(#[from] std::io::Error)
}

impl LlrpError {

  pub(crate) fn short(parameter: &'static str) -> Self {
    LlrpError::Codec {
      parameter,
      reason: "buffer too short".into()
    }
  }
}
