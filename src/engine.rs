use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{info, warn};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;

use crate::client::{
  CallbackSet,
  LlrpClient,
  ReaderCommand,
  ReaderConfig,
  ReaderState,
  RunOutcome,
};
use crate::error::LlrpError;
use crate::params::RoAccessReport;
use crate::rospec::{ReadOpSpec, WriteOpSpec};

/// Engine-wide options: the per-connection configuration plus the
/// reconnection policy.
#[derive(Debug, Clone)]
pub struct EngineConfig {

  pub reader          : ReaderConfig,
  pub reconnect       : bool,
  pub reconnect_delay : Duration
}

impl Default for EngineConfig {
  fn default() -> Self {
    EngineConfig {
      reader          : ReaderConfig::default(),
      reconnect       : false,
      reconnect_delay : Duration::from_secs(1)
    }
  }
}

struct ReaderHandle {

  peer       : SocketAddr,
  commands   : mpsc::UnboundedSender<ReaderCommand>,
  supervisor : JoinHandle<()>
}

/// Multiplexes one user over any number of reader connections: fans
/// callbacks out to each connection, brokers commands in, reconnects lost
/// readers, and reports when everything is finished.
pub struct LlrpEngine {

  config    : EngineConfig,
  callbacks : Arc<CallbackSet>,
  states    : Arc<Mutex<HashMap<SocketAddr, ReaderState>>>,
  readers   : Vec<ReaderHandle>,
  on_finish : Option<Box<dyn FnOnce() + Send>>
}

impl LlrpEngine {

  pub fn new(config: EngineConfig) -> Self {
    LlrpEngine {
      config,
      callbacks: Arc::new(CallbackSet::default()),
      states: Arc::new(Mutex::new(HashMap::new())),
      readers: Vec::new(),
      on_finish: None
    }
  }

  /// Invoked exactly once, after the last connection is gone.
  pub fn on_finish(&mut self, callback: impl FnOnce() + Send + 'static) {
    self.on_finish = Some(Box::new(callback));
  }

  /// Called with every RO_ACCESS_REPORT received while inventorying, on
  /// every current and future connection.
  pub fn add_tag_report_callback(&self, callback: impl Fn(&RoAccessReport) + Send + Sync + 'static) {
    self.callbacks.tag_reports.lock().unwrap().push(Box::new(callback));
  }

  pub fn add_state_callback(
    &self,
    state: ReaderState,
    callback: impl Fn(SocketAddr, ReaderState) + Send + Sync + 'static
  ) {
    self.callbacks.states.lock().unwrap().entry(state).or_default().push(Box::new(callback));
  }

  pub fn add_error_callback(&self, callback: impl Fn(SocketAddr, &LlrpError) + Send + Sync + 'static) {
    self.callbacks.errors.lock().unwrap().push(Box::new(callback));
  }

  /// Opens a connection to a reader and spawns its supervisor. Resolves
  /// once the TCP connect succeeds; a missed `timeout` fails with
  /// `ConnectTimeout` whatever the reconnect policy says.
  pub async fn new_reader(
    &mut self,
    host: &str,
    port: u16,
    timeout: Duration
  ) -> Result<SocketAddr, LlrpError> {

    let (peer, stream) = connect(host, port, timeout).await?;
    info!("connected to {} ({})", host, peer);

    let (commands, command_rx) = mpsc::unbounded_channel();

    let supervisor = tokio::spawn(supervise(
      host.to_string(),
      port,
      timeout,
      peer,
      self.config.clone(),
      self.callbacks.clone(),
      self.states.clone(),
      stream,
      command_rx
    ));

    self.readers.push(ReaderHandle { peer, commands, supervisor });

    Ok(peer)
  }

  /// Graceful teardown on every reader: delete specs, then disconnect.
  pub fn polite_shutdown(&self) {
    info!("requesting polite shutdown of {} readers", self.readers.len());
    for reader in &self.readers {
      let _ = reader.commands.send(ReaderCommand::StopPolitely { disconnect: true });
    }
  }

  /// Abrupt teardown: close sockets without deleting reader-side specs.
  pub fn shutdown(&self) {
    for reader in &self.readers {
      let _ = reader.commands.send(ReaderCommand::Disconnect);
    }
  }

  pub fn pause_inventory(&self, seconds: f32) {
    for reader in &self.readers {
      let _ = reader.commands.send(ReaderCommand::Pause {
        seconds,
        force: false,
        force_regen_rospec: false
      });
    }
  }

  pub fn resume_inventory(&self) {
    for reader in &self.readers {
      let _ = reader.commands.send(ReaderCommand::Resume);
    }
  }

  /// Sets the transmit power index on all readers, or on the one whose
  /// remote IP matches `peername`.
  pub fn set_tx_power(&self, tx_power: u16, peername: Option<IpAddr>) {
    for reader in &self.readers {
      if peername.map(|ip| reader.peer.ip() == ip).unwrap_or(true) {
        let _ = reader.commands.send(ReaderCommand::SetTxPower { tx_power });
      }
    }
  }

  /// Replaces the AccessSpec on every reader with one performing the given
  /// read or write operation.
  pub fn next_access(
    &self,
    read: Option<ReadOpSpec>,
    write: Option<WriteOpSpec>,
    stop: Option<u16>,
    access_spec_id: u32
  ) {
    for reader in &self.readers {
      let _ = reader.commands.send(ReaderCommand::NextAccess {
        read: read.clone(),
        write: write.clone(),
        stop,
        access_spec_id
      });
    }
  }

  /// Current state of every live connection, keyed by peer address.
  pub fn reader_states(&self) -> HashMap<SocketAddr, ReaderState> {
    let states = self.states.lock().unwrap().clone();
    info!("reader states: {:?}", states);
    states
  }

  /// Joins every reader supervisor, then fires `on_finish` exactly once.
  pub async fn wait(&mut self) {
    loop {
      let handle = match self.readers.pop() {
        Some(handle) => handle,
        None => break
      };
      let _ = handle.supervisor.await;
    }

    if let Some(on_finish) = self.on_finish.take() {
      info!("all reader connections finished");
      on_finish();
    }
  }
}

/// TCP connect with a bounded timeout and SO_KEEPALIVE set, as readers
/// routinely sit idle between reports.
async fn connect(host: &str, port: u16, timeout: Duration) -> Result<(SocketAddr, TcpStream), LlrpError> {

  let addr = lookup_host((host, port))
    .await?
    .next()
    .ok_or_else(|| LlrpError::Io(io::Error::new(
      io::ErrorKind::NotFound,
      format!("no address found for {}", host)
    )))?;

  let socket = if addr.is_ipv4() { TcpSocket::new_v4()? } else { TcpSocket::new_v6()? };
  socket.set_keepalive(true)?;

  match time::timeout(timeout, socket.connect(addr)).await {
    Ok(Ok(stream)) => Ok((addr, stream)),
    Ok(Err(e)) => Err(e.into()),
    Err(_) => Err(LlrpError::ConnectTimeout)
  }
}

/// Owns one reader for the engine's lifetime: runs the connection, and on
/// loss either reconnects after the configured delay or gives up.
#[allow(clippy::too_many_arguments)]
async fn supervise(
  host: String,
  port: u16,
  timeout: Duration,
  peer: SocketAddr,
  config: EngineConfig,
  callbacks: Arc<CallbackSet>,
  states: Arc<Mutex<HashMap<SocketAddr, ReaderState>>>,
  first_stream: TcpStream,
  mut commands: mpsc::UnboundedReceiver<ReaderCommand>
) {

  let mut stream = Some(first_stream);

  loop {
    let current = match stream.take() {
      Some(stream) => stream,
      None => match connect(&host, port, timeout).await {
        Ok((_, stream)) => stream,
        Err(e) => {
          warn!("connection to {} failed: {}", host, e);
          for callback in callbacks.errors.lock().unwrap().iter() {
            callback(peer, &e);
          }
          if config.reconnect {
            time::sleep(config.reconnect_delay).await;
            continue;
          }
          break;
        }
      }
    };

    let client = LlrpClient::new(current, peer, config.reader.clone(), callbacks.clone(), states.clone());

    let outcome = client.run(&mut commands).await;

    // the socket is gone whichever way run() returned; the shared state
    // table must not keep advertising this connection
    states.lock().unwrap().remove(&peer);

    match outcome {
      Ok(RunOutcome::Finished) => {
        info!("connection to {} finished", peer);
        break;
      }
      Ok(RunOutcome::Lost) => {
        warn!("lost connection to {}", peer);
        for callback in callbacks.errors.lock().unwrap().iter() {
          callback(peer, &LlrpError::ConnectionLost);
        }
      }
      Err(e) => {
        warn!("connection to {} failed: {}", peer, e);
      }
    }

    if !config.reconnect {
      break;
    }

    info!("reconnecting to {} in {:?}", peer, config.reconnect_delay);
    time::sleep(config.reconnect_delay).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_reconnect_policy_matches_the_protocol_docs() {
    let config = EngineConfig::default();
    assert!(!config.reconnect);
    assert_eq!(config.reconnect_delay, Duration::from_secs(1));
  }
}
