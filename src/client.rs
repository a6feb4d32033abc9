use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use strum_macros::{Display, FromRepr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};

use crate::error::LlrpError;
use crate::llrp::{
  message_name,
  FrameParser,
  LlrpMessage,
  Modulation,
  RequestedCapability,
  DEFAULT_MODULATION,
  TYPE_ADD_ACCESSSPEC_RESPONSE,
  TYPE_ADD_ROSPEC_RESPONSE,
  TYPE_DELETE_ACCESSSPEC_RESPONSE,
  TYPE_DELETE_ROSPEC_RESPONSE,
  TYPE_DISABLE_ACCESSSPEC_RESPONSE,
  TYPE_DISABLE_ROSPEC_RESPONSE,
  TYPE_ENABLE_ACCESSSPEC_RESPONSE,
  TYPE_ENABLE_ROSPEC_RESPONSE,
  TYPE_GET_READER_CAPABILITIES_RESPONSE,
  TYPE_KEEPALIVE,
  TYPE_READER_EVENT_NOTIFICATION,
  TYPE_RO_ACCESS_REPORT,
};
use crate::params::{
  negotiate,
  decode_status,
  select_tx_power,
  NegotiatedRadio,
  ReaderCapabilities,
  ReaderEventNotificationData,
  RoAccessReport,
};
use crate::rospec::{
  AccessOp,
  AccessSpecConfig,
  ReadOpSpec,
  RoSpecConfig,
  TagContentSelector,
  TargetTag,
  WriteOpSpec,
};

/// Connection states. The discriminants are stable identifiers and match
/// the values reported through `reader_states()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ReaderState {
  Disconnected         = 1,
  Connecting           = 2,
  Connected            = 3,
  SentAddRospec        = 4,
  SentEnableRospec     = 5,
  Inventorying         = 6,
  SentDeleteRospec     = 7,
  SentDeleteAccessspec = 8,
  SentGetCapabilities  = 9,
  Pausing              = 10,
  Paused               = 11
}

/// Per-connection options. The engine clones one of these into every
/// connection it opens.
#[derive(Debug, Clone)]
pub struct ReaderConfig {

  pub duration             : f32,
  pub report_every_n_tags  : Option<u16>,
  pub report_timeout_ms    : u32,
  pub antennas             : Vec<u16>,
  pub tx_power             : u16,
  pub modulation           : Modulation,
  pub tari                 : u32,
  pub session              : u8,
  pub tag_population       : u16,
  pub start_inventory      : bool,
  pub reset_on_connect     : bool,
  pub disconnect_when_done : bool,
  pub tag_content_selector : TagContentSelector
}

impl Default for ReaderConfig {
  fn default() -> Self {
    ReaderConfig {
      duration             : 0.0,
      report_every_n_tags  : Some(1),
      report_timeout_ms    : 0,
      antennas             : vec![1],
      tx_power             : 0,
      modulation           : DEFAULT_MODULATION,
      tari                 : 0,
      session              : 2,
      tag_population       : 4,
      start_inventory      : true,
      reset_on_connect     : true,
      disconnect_when_done : false,
      tag_content_selector : TagContentSelector::default()
    }
  }
}

pub type TagReportCallback = Box<dyn Fn(&RoAccessReport) + Send + Sync>;
pub type StateCallback     = Box<dyn Fn(SocketAddr, ReaderState) + Send + Sync>;
pub type ErrorCallback     = Box<dyn Fn(SocketAddr, &LlrpError) + Send + Sync>;

/// Engine-level callback fan-out, shared with every connection.
#[derive(Default)]
pub struct CallbackSet {

  pub tag_reports : Mutex<Vec<TagReportCallback>>,
  pub states      : Mutex<HashMap<ReaderState, Vec<StateCallback>>>,
  pub errors      : Mutex<Vec<ErrorCallback>>
}

/// Commands the engine sends into a running connection task.
#[derive(Debug)]
pub enum ReaderCommand {
  StopPolitely {
    disconnect: bool
  },
  Pause {
    seconds            : f32,
    force              : bool,
    force_regen_rospec : bool
  },
  Resume,
  SetTxPower {
    tx_power: u16
  },
  NextAccess {
    read           : Option<ReadOpSpec>,
    write          : Option<WriteOpSpec>,
    stop           : Option<u16>,
    access_spec_id : u32
  },
  Disconnect
}

/// Follow-up steps a continuation can schedule. Actions run on the
/// connection task and may register further continuations.
#[derive(Debug, Clone)]
pub(crate) enum Action {
  SetState(ReaderState),
  EnterInventorying,
  StartInventory,
  SendEnableRospec,
  SendDeleteRospec { then_start_inventory: bool },
  ContinueAccessSwap(AccessSpecConfig),
  SendEnableAccessspec(u32),
  Panic(&'static str),
  Complain(&'static str)
}

/// One registered continuation: what to do when the awaited response turns
/// out to be a success, and what to do when it is a failure.
#[derive(Debug)]
pub(crate) struct Continuation {

  pub on_success : Vec<Action>,
  pub on_failure : Vec<Action>
}

/// Per-response-type FIFO queues of continuations.
#[derive(Debug, Default)]
pub(crate) struct ContinuationRegistry {
  queues: HashMap<u16, VecDeque<Continuation>>
}

impl ContinuationRegistry {

  pub fn register(&mut self, message_type: u16, continuation: Continuation) {
    self.queues.entry(message_type).or_default().push_back(continuation);
  }

  pub fn drain(&mut self, message_type: u16) -> VecDeque<Continuation> {
    self.queues.remove(&message_type).unwrap_or_default()
  }

  pub fn drain_all(&mut self) -> Vec<(u16, VecDeque<Continuation>)> {
    self.queues.drain().collect()
  }

  pub fn is_empty(&self, message_type: u16) -> bool {
    self.queues.get(&message_type).map(|q| q.is_empty()).unwrap_or(true)
  }
}

/// What `run` tells the supervisor when it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
  /// Deliberate end: polite shutdown completed or an abrupt disconnect.
  Finished,
  /// The reader went away; subject to the engine's reconnect policy.
  Lost
}

enum Flow {
  Continue,
  Closed
}

/// One LLRP reader connection: owns the socket, the parse buffer, the
/// state machine, and the pending continuations.
pub struct LlrpClient {

  peer              : SocketAddr,
  stream            : TcpStream,
  parser            : FrameParser,
  state             : ReaderState,
  continuations     : ContinuationRegistry,
  config            : ReaderConfig,
  capabilities      : Option<ReaderCapabilities>,
  radio             : Option<NegotiatedRadio>,
  rospec            : Option<RoSpecConfig>,
  disconnecting     : bool,
  message_id        : u32,
  callbacks         : Arc<CallbackSet>,
  states            : Arc<Mutex<HashMap<SocketAddr, ReaderState>>>,
  duration_deadline : Option<Instant>,
  resume_deadline   : Option<Instant>
}

impl LlrpClient {

  pub fn new(
    stream: TcpStream,
    peer: SocketAddr,
    config: ReaderConfig,
    callbacks: Arc<CallbackSet>,
    states: Arc<Mutex<HashMap<SocketAddr, ReaderState>>>
  ) -> Self {

    if config.reset_on_connect {
      info!("will reset reader state on connect");
    }
    if config.start_inventory {
      info!("will start inventory on connect");
    }
    info!("using antennas: {:?}", config.antennas);

    LlrpClient {
      peer,
      stream,
      parser: FrameParser::new(),
      state: ReaderState::Disconnected,
      continuations: ContinuationRegistry::default(),
      config,
      capabilities: None,
      radio: None,
      rospec: None,
      disconnecting: false,
      message_id: 1001,
      callbacks,
      states,
      duration_deadline: None,
      resume_deadline: None
    }
  }

  pub fn state(&self) -> ReaderState {
    self.state
  }

  pub fn capabilities(&self) -> Option<&ReaderCapabilities> {
    self.capabilities.as_ref()
  }

  fn next_message_id(&mut self) -> u32 {
    let current_id = self.message_id;
    self.message_id += 1;

    current_id
  }

  /// Drives the connection until it finishes, is lost, or hits a fatal
  /// protocol error. The command receiver outlives individual connections
  /// so queued commands survive a reconnect.
  pub async fn run(
    mut self,
    commands: &mut mpsc::UnboundedReceiver<ReaderCommand>
  ) -> Result<RunOutcome, LlrpError> {

    info!("connected to reader at {}", self.peer);
    self.set_state(ReaderState::Connecting);

    let far_future = Duration::from_secs(86400);

    loop {
      let duration_at = self.duration_deadline.unwrap_or_else(|| Instant::now() + far_future);
      let resume_at = self.resume_deadline.unwrap_or_else(|| Instant::now() + far_future);

      tokio::select! {

        read = self.stream.read_buf(self.parser.buffer_mut()) => {
          match read {
            Ok(0) => {
              info!("reader {} closed the connection", self.peer);
              let deliberate = self.disconnecting;
              self.connection_closed();
              return Ok(if deliberate { RunOutcome::Finished } else { RunOutcome::Lost });
            }
            Ok(_) => {
              if let Flow::Closed = self.drain_frames().await? {
                return Ok(RunOutcome::Finished);
              }
            }
            Err(e) => {
              self.connection_closed();
              return Err(e.into());
            }
          }
        }

        command = commands.recv() => {
          match command {
            Some(command) => {
              if let Flow::Closed = self.handle_command(command).await? {
                return Ok(RunOutcome::Finished);
              }
            }
            None => {
              // engine went away; nothing left to drive this connection
              self.connection_closed();
              return Ok(RunOutcome::Finished);
            }
          }
        }

        _ = time::sleep_until(duration_at), if self.duration_deadline.is_some() => {
          self.duration_deadline = None;
          info!("inventory duration elapsed; stopping politely");
          let disconnect = self.config.disconnect_when_done;
          self.stop_politely(disconnect, false).await?;
        }

        _ = time::sleep_until(resume_at), if self.resume_deadline.is_some() => {
          self.resume_deadline = None;
          self.resume().await?;
        }
      }
    }
  }

  async fn drain_frames(&mut self) -> Result<Flow, LlrpError> {
    loop {
      match self.parser.next_frame() {

        Ok(Some(message)) => {
          if let Flow::Closed = self.handle_message(message).await? {
            return Ok(Flow::Closed);
          }
        }

        Ok(None) => return Ok(Flow::Continue),

        Err(LlrpError::UnknownMessageType(code)) => {
          warn!("dropping frame with unknown message type {}", code);
        }

        Err(e) => {
          // framing is unrecoverable: the stream offset can no longer be trusted
          error!("framing error on {}: {}", self.peer, e);
          self.report_error(&e);
          self.connection_closed();
          return Err(e);
        }
      }
    }
  }

  async fn handle_command(&mut self, command: ReaderCommand) -> Result<Flow, LlrpError> {
    debug!("command for {}: {:?}", self.peer, command);

    match command {

      ReaderCommand::StopPolitely { disconnect } => {
        self.stop_politely(disconnect, false).await?;
      }

      ReaderCommand::Pause { seconds, force, force_regen_rospec } => {
        self.pause(seconds, force, force_regen_rospec).await?;
      }

      ReaderCommand::Resume => {
        self.resume().await?;
      }

      ReaderCommand::SetTxPower { tx_power } => {
        self.set_tx_power(tx_power).await?;
      }

      ReaderCommand::NextAccess { read, write, stop, access_spec_id } => {
        self.next_access(read, write, stop, access_spec_id).await?;
      }

      ReaderCommand::Disconnect => {
        info!("closing connection to {} without protocol teardown", self.peer);
        self.disconnecting = true;
        let message_id = self.next_message_id();
        let _ = self.send_message(LlrpMessage::new_close_connection(message_id)).await;
        let _ = self.stream.shutdown().await;
        self.connection_closed();
        return Ok(Flow::Closed);
      }
    }

    Ok(Flow::Continue)
  }

  /// Implements the LLRP client state machine.
  async fn handle_message(&mut self, message: LlrpMessage) -> Result<Flow, LlrpError> {
    let name = message.name().unwrap_or("UNKNOWN");
    debug!("received {} (id {}) in state {}", name, message.message_id, self.state);

    // keepalives can occur at any time, whatever the state
    if message.message_type == TYPE_KEEPALIVE {
      let ack = LlrpMessage::new_keepalive_ack(message.message_id);
      self.send_message(ack).await?;
      return Ok(Flow::Continue);
    }

    if message.message_type == TYPE_RO_ACCESS_REPORT {
      if self.state != ReaderState::Inventorying {
        debug!("ignoring RO_ACCESS_REPORT because not inventorying");
        return Ok(Flow::Continue);
      }

      match RoAccessReport::decode(&message.payload) {
        Ok(mut report) => {
          report.peer = Some(self.peer);
          let callbacks = self.callbacks.tag_reports.lock().unwrap();
          for callback in callbacks.iter() {
            callback(&report);
          }
        }
        Err(e) => {
          warn!("dropping malformed RO_ACCESS_REPORT: {}", e);
        }
      }

      self.process_continuations(TYPE_RO_ACCESS_REPORT, true).await;
      return Ok(Flow::Continue);
    }

    match self.state {

      // expect only reader event notifications until the handshake starts
      ReaderState::Disconnected | ReaderState::Connecting | ReaderState::Connected => {
        if message.message_type != TYPE_READER_EVENT_NOTIFICATION {
          error!("unexpected message {} while connecting", name);
          return Ok(Flow::Continue);
        }

        let event = match ReaderEventNotificationData::decode(&message.payload) {
          Ok(event) => event,
          Err(e) => {
            warn!("dropping malformed {} frame: {}", name, e);
            return Ok(Flow::Continue);
          }
        };

        if !event.is_success() {
          error!(
            "could not start session on reader {}: connection attempt status {:?}",
            self.peer, event.connection_attempt
          );
          return Ok(Flow::Continue);
        }

        self.process_continuations(TYPE_READER_EVENT_NOTIFICATION, true).await;
        self.send_get_reader_capabilities().await?;
      }

      ReaderState::SentGetCapabilities => {
        if message.message_type != TYPE_GET_READER_CAPABILITIES_RESPONSE {
          error!("unexpected response {} when getting capabilities", name);
          return Ok(Flow::Continue);
        }

        return self.handle_capabilities_response(&message.payload).await;
      }

      ReaderState::SentAddRospec => {
        if message.message_type != TYPE_ADD_ROSPEC_RESPONSE {
          error!("unexpected response {} when adding ROSpec", name);
          return Ok(Flow::Continue);
        }

        if let Some(err) = self.check_status("ADD_ROSPEC", &message.payload) {
          self.process_continuations(TYPE_ADD_ROSPEC_RESPONSE, false).await;
          self.connection_closed();
          return Err(err);
        }

        self.process_continuations(TYPE_ADD_ROSPEC_RESPONSE, true).await;
      }

      ReaderState::SentEnableRospec => {
        if message.message_type != TYPE_ENABLE_ROSPEC_RESPONSE {
          error!("unexpected response {} when enabling ROSpec", name);
          return Ok(Flow::Continue);
        }

        if let Some(err) = self.check_status("ENABLE_ROSPEC", &message.payload) {
          self.process_continuations(TYPE_ENABLE_ROSPEC_RESPONSE, false).await;
          self.connection_closed();
          return Err(err);
        }

        self.process_continuations(TYPE_ENABLE_ROSPEC_RESPONSE, true).await;
      }

      ReaderState::Pausing => {
        if message.message_type != TYPE_DISABLE_ROSPEC_RESPONSE {
          error!("unexpected response {} when disabling ROSpec", name);
          return Ok(Flow::Continue);
        }

        // teardown is best-effort: a failed disable still pauses
        let ok = match decode_status(&message.payload) {
          Ok(status) => {
            if !status.is_success() {
              warn!(
                "DISABLE_ROSPEC failed with status {}: {}",
                status.status_code, status.error_description
              );
            }
            status.is_success()
          }
          Err(e) => {
            warn!("dropping malformed {} frame: {}", name, e);
            return Ok(Flow::Continue);
          }
        };

        self.process_continuations(TYPE_DISABLE_ROSPEC_RESPONSE, ok).await;
      }

      ReaderState::Inventorying => {
        match message.message_type {

          TYPE_READER_EVENT_NOTIFICATION => {
            match ReaderEventNotificationData::decode(&message.payload) {
              Ok(event) => {
                self.process_continuations(TYPE_READER_EVENT_NOTIFICATION, event.is_success()).await;
              }
              Err(e) => {
                warn!("dropping malformed {} frame: {}", name, e);
              }
            }
          }

          TYPE_ADD_ACCESSSPEC_RESPONSE
          | TYPE_ENABLE_ACCESSSPEC_RESPONSE
          | TYPE_DISABLE_ACCESSSPEC_RESPONSE
          | TYPE_DELETE_ACCESSSPEC_RESPONSE => {
            let ok = match decode_status(&message.payload) {
              Ok(status) => {
                if !status.is_success() {
                  let err = LlrpError::ProtocolStatus {
                    message: name,
                    status_code: status.status_code,
                    description: status.error_description.clone()
                  };
                  warn!("{}", err);
                  self.report_error(&err);
                }
                status.is_success()
              }
              Err(e) => {
                warn!("dropping malformed {} frame: {}", name, e);
                return Ok(Flow::Continue);
              }
            };

            self.process_continuations(message.message_type, ok).await;
          }

          _ => {
            error!("unexpected message {} while inventorying", name);
            return Ok(Flow::Continue);
          }
        }
      }

      ReaderState::SentDeleteAccessspec => {
        if message.message_type != TYPE_DELETE_ACCESSSPEC_RESPONSE {
          error!("unexpected response {} when deleting AccessSpec", name);
          return Ok(Flow::Continue);
        }

        if let Ok(status) = decode_status(&message.payload) {
          if !status.is_success() {
            warn!(
              "DELETE_ACCESSSPEC failed with status {}: {}; continuing teardown",
              status.status_code, status.error_description
            );
          }
        }

        // best-effort teardown advances regardless
        self.process_continuations(TYPE_DELETE_ACCESSSPEC_RESPONSE, true).await;
      }

      ReaderState::SentDeleteRospec => {
        if message.message_type != TYPE_DELETE_ROSPEC_RESPONSE {
          error!("unexpected response {} when deleting ROSpec", name);
          return Ok(Flow::Continue);
        }

        match decode_status(&message.payload) {
          Ok(status) if status.is_success() => {
            info!("reader finished inventory");
          }
          Ok(status) => {
            warn!(
              "DELETE_ROSPEC failed with status {}: {}",
              status.status_code, status.error_description
            );
          }
          Err(e) => {
            warn!("dropping malformed {} frame: {}", name, e);
          }
        }

        if self.disconnecting {
          self.set_state(ReaderState::Disconnected);
        } else {
          self.set_state(ReaderState::Connected);
        }

        self.process_continuations(TYPE_DELETE_ROSPEC_RESPONSE, true).await;

        if self.disconnecting {
          info!("disconnecting");
          let _ = self.stream.shutdown().await;
          self.connection_closed();
          return Ok(Flow::Closed);
        }
      }

      ReaderState::Paused => {
        warn!("message {} received in state {}", name, self.state);
      }
    }

    if !self.continuations.is_empty(message.message_type) {
      error!("continuations remain registered for {} after processing; this is a bug", name);
    }

    Ok(Flow::Continue)
  }

  async fn handle_capabilities_response(&mut self, payload: &[u8]) -> Result<Flow, LlrpError> {
    let caps = match ReaderCapabilities::decode(payload) {
      Ok(caps) => caps,
      Err(e) => {
        warn!("dropping malformed GET_READER_CAPABILITIES_RESPONSE frame: {}", e);
        return Ok(Flow::Continue);
      }
    };

    if !caps.status.is_success() {
      let err = LlrpError::ProtocolStatus {
        message: "GET_READER_CAPABILITIES",
        status_code: caps.status.status_code,
        description: caps.status.error_description.clone()
      };
      error!("error getting capabilities: {}", err);
      self.report_error(&err);
      self.process_continuations(TYPE_GET_READER_CAPABILITIES_RESPONSE, false).await;
      self.connection_closed();
      return Err(err);
    }

    match negotiate(
      &caps,
      &self.config.antennas,
      self.config.tx_power,
      self.config.modulation,
      self.config.tari
    ) {
      Ok(radio) => {
        info!(
          "using reader mode {} at {} dBm on antennas {:?}",
          radio.mode.mode_identifier, radio.tx_power_dbm, radio.antennas
        );
        self.radio = Some(radio);
      }

      Err(e @ LlrpError::InvalidTxPower { .. }) => {
        // fatal for the operation only: the connection stays up, but the
        // pending continuation must not fire and inventory must not start
        error!("capability negotiation failed: {}", e);
        self.report_error(&e);
        let _ = self.continuations.drain(TYPE_GET_READER_CAPABILITIES_RESPONSE);
        self.capabilities = Some(caps);
        return Ok(Flow::Continue);
      }

      Err(e) => {
        error!("capability negotiation failed: {}", e);
        self.report_error(&e);
        self.process_continuations(TYPE_GET_READER_CAPABILITIES_RESPONSE, false).await;
        self.connection_closed();
        return Err(e);
      }
    }

    self.capabilities = Some(caps);
    self.process_continuations(TYPE_GET_READER_CAPABILITIES_RESPONSE, true).await;

    if self.config.reset_on_connect {
      let then_start = self.config.start_inventory;
      self.stop_politely(false, then_start).await?;
    } else if self.config.start_inventory {
      self.start_inventory().await?;
    }

    Ok(Flow::Continue)
  }

  /// Decodes the LLRPStatus of a response; `Some(err)` means the operation
  /// failed in a way that is fatal for this connection.
  fn check_status(&self, operation: &'static str, payload: &[u8]) -> Option<LlrpError> {
    match decode_status(payload) {
      Ok(status) if status.is_success() => None,
      Ok(status) => {
        let err = LlrpError::ProtocolStatus {
          message: operation,
          status_code: status.status_code,
          description: status.error_description
        };
        error!("{}", err);
        self.report_error(&err);
        Some(err)
      }
      Err(e) => {
        error!("malformed {} response: {}", operation, e);
        self.report_error(&e);
        Some(e)
      }
    }
  }

  async fn process_continuations(&mut self, message_type: u16, is_success: bool) {
    let queue = self.continuations.drain(message_type);
    if queue.is_empty() {
      return;
    }

    debug!(
      "running {} continuations for {} (success={})",
      queue.len(),
      message_name(message_type).unwrap_or("?"),
      is_success
    );

    for continuation in queue {
      let actions = if is_success { continuation.on_success } else { continuation.on_failure };
      for action in actions {
        // one failing action must not starve the rest of the queue
        if let Err(e) = self.execute(action).await {
          error!("continuation action failed: {}", e);
        }
      }
    }
  }

  async fn execute(&mut self, action: Action) -> Result<(), LlrpError> {
    match action {

      Action::SetState(state) => {
        self.set_state(state);
        Ok(())
      }

      Action::EnterInventorying => {
        self.set_state(ReaderState::Inventorying);
        if self.config.duration > 0.0 {
          self.duration_deadline =
            Some(Instant::now() + Duration::from_secs_f32(self.config.duration));
        }
        Ok(())
      }

      Action::StartInventory => self.start_inventory().await,

      Action::SendEnableRospec => self.send_enable_rospec().await,

      Action::SendDeleteRospec { then_start_inventory } => {
        self.send_delete_rospec(then_start_inventory).await
      }

      Action::ContinueAccessSwap(spec) => {
        // delete is idempotent teardown: no continuation, no response gate
        let accessspec_id = spec.access_spec_id;
        let message_id = self.next_message_id();
        self.send_message(LlrpMessage::new_delete_accessspec(message_id, accessspec_id)).await?;
        self.start_access(spec).await
      }

      Action::SendEnableAccessspec(accessspec_id) => {
        let message_id = self.next_message_id();
        self.send_message(LlrpMessage::new_enable_accessspec(message_id, accessspec_id)).await
      }

      Action::Panic(context) => {
        error!("{}: giving up on the operation", context);
        Ok(())
      }

      Action::Complain(context) => {
        warn!("{}", context);
        Ok(())
      }
    }
  }

  async fn send_message(&mut self, message: LlrpMessage) -> Result<(), LlrpError> {
    debug!("sending {} (id {})", message.name().unwrap_or("UNKNOWN"), message.message_id);
    let frame = message.encode();
    self.stream.write_all(&frame).await?;
    Ok(())
  }

  async fn send_get_reader_capabilities(&mut self) -> Result<(), LlrpError> {
    let message_id = self.next_message_id();
    let message = LlrpMessage::new_get_reader_capabilities(message_id, RequestedCapability::All);
    self.send_message(message).await?;
    self.set_state(ReaderState::SentGetCapabilities);

    self.continuations.register(TYPE_GET_READER_CAPABILITIES_RESPONSE, Continuation {
      on_success: vec![Action::SetState(ReaderState::Connected)],
      on_failure: vec![Action::Panic("GET_READER_CAPABILITIES failed")]
    });

    Ok(())
  }

  /// Adds the current ROSpec to the reader and chains its enablement.
  async fn start_inventory(&mut self) -> Result<(), LlrpError> {
    if self.state == ReaderState::Inventorying {
      warn!("ignoring start_inventory() while already inventorying");
      return Ok(());
    }

    info!("starting inventory");

    let rospec = self.current_rospec()?;
    let message_id = self.next_message_id();
    self.send_message(LlrpMessage::new_add_rospec(message_id, rospec.encode())).await?;
    self.set_state(ReaderState::SentAddRospec);

    self.continuations.register(TYPE_ADD_ROSPEC_RESPONSE, Continuation {
      on_success: vec![Action::SendEnableRospec],
      on_failure: vec![Action::Panic("ADD_ROSPEC failed")]
    });

    Ok(())
  }

  async fn send_enable_rospec(&mut self) -> Result<(), LlrpError> {
    let rospec_id = self.rospec.as_ref().map(|r| r.rospec_id).unwrap_or(1);
    let message_id = self.next_message_id();
    self.send_message(LlrpMessage::new_enable_rospec(message_id, rospec_id)).await?;
    self.set_state(ReaderState::SentEnableRospec);

    self.continuations.register(TYPE_ENABLE_ROSPEC_RESPONSE, Continuation {
      on_success: vec![Action::EnterInventorying],
      on_failure: vec![Action::Panic("ENABLE_ROSPEC failed")]
    });

    Ok(())
  }

  async fn send_delete_rospec(&mut self, then_start_inventory: bool) -> Result<(), LlrpError> {
    let message_id = self.next_message_id();
    self.send_message(LlrpMessage::new_delete_rospec(message_id, 0)).await?;
    self.set_state(ReaderState::SentDeleteRospec);

    let on_success = if then_start_inventory {
      vec![Action::StartInventory]
    } else {
      vec![]
    };

    self.continuations.register(TYPE_DELETE_ROSPEC_RESPONSE, Continuation {
      on_success,
      on_failure: vec![Action::Complain("DELETE_ROSPEC failed")]
    });

    Ok(())
  }

  /// Deletes all AccessSpecs and ROSpecs on the reader, then optionally
  /// disconnects or restarts inventory once the teardown acknowledges.
  async fn stop_politely(&mut self, disconnect: bool, then_start_inventory: bool) -> Result<(), LlrpError> {
    info!("stopping politely");

    if disconnect {
      info!("will disconnect when stopped");
      self.disconnecting = true;
    }

    let message_id = self.next_message_id();
    self.send_message(LlrpMessage::new_delete_accessspec(message_id, 0)).await?;
    self.set_state(ReaderState::SentDeleteAccessspec);

    self.continuations.register(TYPE_DELETE_ACCESSSPEC_RESPONSE, Continuation {
      on_success: vec![Action::SendDeleteRospec { then_start_inventory }],
      on_failure: vec![
        Action::Complain("DELETE_ACCESSSPEC failed"),
        Action::SendDeleteRospec { then_start_inventory }
      ]
    });

    Ok(())
  }

  async fn pause(&mut self, seconds: f32, force: bool, force_regen_rospec: bool) -> Result<(), LlrpError> {
    debug!("pause({})", seconds);

    if self.state != ReaderState::Inventorying {
      if !force {
        info!("ignoring pause() because not inventorying");
        return Ok(());
      }
      info!("forcing pause()");
    }

    if seconds > 0.0 {
      info!("pausing for {} seconds", seconds);
    }

    if force_regen_rospec {
      self.rospec = None;
    }

    let rospec_id = self.current_rospec()?.rospec_id;
    let message_id = self.next_message_id();
    self.send_message(LlrpMessage::new_disable_rospec(message_id, rospec_id)).await?;
    self.set_state(ReaderState::Pausing);

    self.continuations.register(TYPE_DISABLE_ROSPEC_RESPONSE, Continuation {
      on_success: vec![Action::SetState(ReaderState::Paused)],
      on_failure: vec![
        Action::Complain("pause() failed"),
        Action::SetState(ReaderState::Paused)
      ]
    });

    if seconds > 0.0 {
      self.resume_deadline = Some(Instant::now() + Duration::from_secs_f32(seconds));
    }

    Ok(())
  }

  async fn resume(&mut self) -> Result<(), LlrpError> {
    debug!("resume()");

    match self.state {
      ReaderState::Connected | ReaderState::Disconnected => {
        return self.start_inventory().await;
      }
      ReaderState::Paused => {}
      _ => {
        debug!("cannot resume() if not paused; ignoring");
        return Ok(());
      }
    }

    info!("resuming");

    // rebuild the ROSpec if a power change invalidated it
    self.current_rospec()?;
    self.send_enable_rospec().await
  }

  async fn set_tx_power(&mut self, tx_power: u16) -> Result<(), LlrpError> {
    let table = match self.radio {
      Some(ref radio) => radio.tx_power_table.clone(),
      None => {
        let err = LlrpError::CapabilityMismatch(
          "cannot set transmit power before capability negotiation".into()
        );
        warn!("{}", err);
        self.report_error(&err);
        return Ok(());
      }
    };

    match select_tx_power(tx_power, &table) {
      Ok((index, dbm)) => {
        let mut changed = false;
        if let Some(ref mut radio) = self.radio {
          if radio.tx_power_index != index {
            radio.tx_power_index = index;
            radio.tx_power_dbm = dbm;
            changed = true;
          }
        }

        if !changed {
          return Ok(());
        }

        debug!("tx_power: {} ({} dBm)", index, dbm);

        if self.state == ReaderState::Inventorying {
          // restart with a regenerated ROSpec carrying the new power index
          self.pause(0.5, false, true).await?;
        } else {
          self.rospec = None;
        }

        Ok(())
      }

      Err(e) => {
        error!("{}", e);
        self.report_error(&e);
        Ok(())
      }
    }
  }

  /// Swaps the reader's AccessSpec: disable, delete, add, enable. A failed
  /// disable aborts the swap and is reported.
  async fn next_access(
    &mut self,
    read: Option<ReadOpSpec>,
    write: Option<WriteOpSpec>,
    stop: Option<u16>,
    access_spec_id: u32
  ) -> Result<(), LlrpError> {

    let op = match (read, write) {
      (Some(read), _) => AccessOp::Read(read),
      (None, Some(write)) => AccessOp::Write(write),
      (None, None) => {
        error!("next_access() requires a read or a write operation");
        return Ok(());
      }
    };

    let spec = AccessSpecConfig {
      access_spec_id,
      antenna_id: 0,
      rospec_id: 0,
      target: TargetTag::default(),
      op,
      operation_count: stop.unwrap_or(5)
    };

    let message_id = self.next_message_id();
    self.send_message(LlrpMessage::new_disable_accessspec(message_id, access_spec_id)).await?;

    self.continuations.register(TYPE_DISABLE_ACCESSSPEC_RESPONSE, Continuation {
      on_success: vec![Action::ContinueAccessSwap(spec)],
      on_failure: vec![Action::Panic("DISABLE_ACCESSSPEC failed")]
    });

    Ok(())
  }

  async fn start_access(&mut self, spec: AccessSpecConfig) -> Result<(), LlrpError> {
    let accessspec_id = spec.access_spec_id;
    let message_id = self.next_message_id();
    self.send_message(LlrpMessage::new_add_accessspec(message_id, spec.encode())).await?;

    self.continuations.register(TYPE_ADD_ACCESSSPEC_RESPONSE, Continuation {
      on_success: vec![Action::SendEnableAccessspec(accessspec_id)],
      on_failure: vec![Action::Panic("ADD_ACCESSSPEC failed")]
    });

    Ok(())
  }

  /// The cached ROSpec, built from the negotiated radio on first use.
  fn current_rospec(&mut self) -> Result<RoSpecConfig, LlrpError> {
    if let Some(ref rospec) = self.rospec {
      return Ok(rospec.clone());
    }

    let radio = self.radio.as_ref().ok_or_else(|| {
      LlrpError::CapabilityMismatch("cannot build a ROSpec before capability negotiation".into())
    })?;

    let rospec = RoSpecConfig {
      rospec_id            : 1,
      priority             : 0,
      duration_sec         : (self.config.duration > 0.0).then_some(self.config.duration),
      report_every_n_tags  : self.config.report_every_n_tags,
      report_timeout_ms    : self.config.report_timeout_ms,
      tx_power_index       : radio.tx_power_index,
      antennas             : radio.antennas.clone(),
      mode_index           : radio.mode.mode_identifier as u16,
      tari                 : self.config.tari as u16,
      session              : self.config.session,
      tag_population       : self.config.tag_population,
      tag_content_selector : self.config.tag_content_selector.clone()
    };

    debug!("built ROSpec: {:?}", rospec);
    self.rospec = Some(rospec.clone());

    Ok(rospec)
  }

  fn set_state(&mut self, new_state: ReaderState) {
    debug!("state change: {} -> {}", self.state, new_state);

    if self.state == ReaderState::Inventorying && new_state != ReaderState::Inventorying {
      // a pending auto-stop no longer applies once inventory ends
      self.duration_deadline = None;
    }

    self.state = new_state;
    self.states.lock().unwrap().insert(self.peer, new_state);

    let callbacks = self.callbacks.states.lock().unwrap();
    if let Some(callbacks) = callbacks.get(&new_state) {
      for callback in callbacks {
        callback(self.peer, new_state);
      }
    }
  }

  fn report_error(&self, error: &LlrpError) {
    let callbacks = self.callbacks.errors.lock().unwrap();
    for callback in callbacks.iter() {
      callback(self.peer, error);
    }
  }

  /// Terminal cleanup: pending continuations are dropped with a failure
  /// signal and the connection leaves the shared state table.
  fn connection_closed(&mut self) {
    for (message_type, queue) in self.continuations.drain_all() {
      if !queue.is_empty() {
        warn!(
          "dropping {} pending continuations for {} on closed connection",
          queue.len(),
          message_name(message_type).unwrap_or("?")
        );
      }
    }

    self.set_state(ReaderState::Disconnected);
    self.states.lock().unwrap().remove(&self.peer);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::llrp::TYPE_ADD_ROSPEC_RESPONSE;

  #[test]
  fn continuation_queues_are_fifo() {
    let mut registry = ContinuationRegistry::default();

    registry.register(TYPE_ADD_ROSPEC_RESPONSE, Continuation {
      on_success: vec![Action::SetState(ReaderState::Connected)],
      on_failure: vec![]
    });
    registry.register(TYPE_ADD_ROSPEC_RESPONSE, Continuation {
      on_success: vec![Action::SetState(ReaderState::Paused)],
      on_failure: vec![]
    });

    let drained = registry.drain(TYPE_ADD_ROSPEC_RESPONSE);
    assert_eq!(drained.len(), 2);
    assert!(matches!(drained[0].on_success[0], Action::SetState(ReaderState::Connected)));
    assert!(matches!(drained[1].on_success[0], Action::SetState(ReaderState::Paused)));

    assert!(registry.is_empty(TYPE_ADD_ROSPEC_RESPONSE));
  }

  #[test]
  fn draining_an_unused_queue_is_empty_not_an_error() {
    let mut registry = ContinuationRegistry::default();
    assert!(registry.drain(TYPE_ADD_ROSPEC_RESPONSE).is_empty());
  }

  #[test]
  fn reader_states_keep_their_stable_identifiers() {
    assert_eq!(ReaderState::Disconnected as u8, 1);
    assert_eq!(ReaderState::Inventorying as u8, 6);
    assert_eq!(ReaderState::Paused as u8, 11);
    assert_eq!(ReaderState::from_repr(9), Some(ReaderState::SentGetCapabilities));
    assert_eq!(ReaderState::from_repr(12), None);
  }

  #[test]
  fn reader_states_display_like_the_protocol_log() {
    assert_eq!(ReaderState::SentAddRospec.to_string(), "SENT_ADD_ROSPEC");
    assert_eq!(ReaderState::Inventorying.to_string(), "INVENTORYING");
  }

  #[test]
  fn default_config_matches_documented_defaults() {
    let config = ReaderConfig::default();
    assert_eq!(config.antennas, vec![1]);
    assert_eq!(config.session, 2);
    assert_eq!(config.tag_population, 4);
    assert_eq!(config.modulation, Modulation::M4);
    assert!(config.start_inventory);
    assert!(config.reset_on_connect);
    assert!(!config.disconnect_when_done);
  }
}
