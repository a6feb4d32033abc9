pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod llrp;
pub mod params;
pub mod rospec;

pub use client::{LlrpClient, ReaderConfig, ReaderState};
pub use engine::{EngineConfig, LlrpEngine};
pub use error::LlrpError;
pub use llrp::{FrameParser, LlrpMessage, Modulation, DEFAULT_MODULATION, LLRP_PORT};
pub use params::{NegotiatedRadio, ReaderCapabilities, RoAccessReport, TagReport};
pub use rospec::{
  AccessOp,
  AccessSpecConfig,
  LockOpSpec,
  LockPayload,
  ReadOpSpec,
  RoSpecConfig,
  TagContentSelector,
  TargetTag,
  WriteOpSpec,
};
