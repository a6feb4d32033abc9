use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use llrp_client::config;
use llrp_client::{EngineConfig, LlrpEngine, Modulation, ReaderConfig};

#[tokio::main]
async fn main() {
  std::process::exit(run().await);
}

// exit codes: 0 clean shutdown, 1 configuration error, 2 protocol error
async fn run() -> i32 {

  let config_path = match std::env::args().nth(1) {
    Some(path) => path,
    None => {
      eprintln!("usage: inventory <config.json>");
      return 1;
    }
  };

  let config = match config::load_config(&config_path) {
    Ok(config) => config,
    Err(e) => {
      eprintln!("failed to load {}: {}", config_path, e);
      return 1;
    }
  };

  if let Err(e) = config.validate() {
    eprintln!("invalid configuration: {}", e);
    return 1;
  }

  env_logger::Builder::from_env(
    env_logger::Env::default().default_filter_or(config.log_level.clone())
  ).init();

  let modulation = match config.modulation.parse::<Modulation>() {
    Ok(modulation) => modulation,
    Err(_) => return 1 // unreachable past validate(), but no reason to panic
  };

  let tari = if config.tari == 0 {
    let recommended = modulation.default_tari();
    info!("selected recommended Tari of {} for {}", recommended, modulation);
    recommended
  } else {
    config.tari
  };

  let engine_config = EngineConfig {
    reader: ReaderConfig {
      duration             : config.duration,
      report_every_n_tags  : Some(config.report_every_n_tags),
      report_timeout_ms    : config.report_timeout_ms,
      antennas             : config.antennas.clone(),
      tx_power             : config.tx_power,
      modulation,
      tari,
      session              : config.session,
      tag_population       : config.tag_population,
      start_inventory      : true,
      reset_on_connect     : true,
      disconnect_when_done : config.duration > 0.0,
      tag_content_selector : Default::default()
    },
    reconnect: config.reconnect,
    reconnect_delay: Duration::from_secs(1)
  };

  let mut engine = LlrpEngine::new(engine_config);

  let total_tags = Arc::new(AtomicU64::new(0));
  let protocol_error = Arc::new(AtomicBool::new(false));

  {
    let total_tags = total_tags.clone();
    engine.add_tag_report_callback(move |report| {
      if report.tags.is_empty() {
        info!("no tags seen");
        return;
      }
      for tag in &report.tags {
        println!("{}", tag);
        total_tags.fetch_add(tag.tag_seen_count.unwrap_or(1) as u64, Ordering::Relaxed);
      }
    });
  }

  {
    let protocol_error = protocol_error.clone();
    engine.add_error_callback(move |peer, e| {
      error!("reader {}: {}", peer, e);
      protocol_error.store(true, Ordering::Relaxed);
    });
  }

  {
    let total_tags = total_tags.clone();
    engine.on_finish(move || {
      info!("total # of tags seen: {}", total_tags.load(Ordering::Relaxed));
    });
  }

  let timeout = Duration::from_millis(config.connect_timeout_ms);
  for host in &config.hosts {
    if let Err(e) = engine.new_reader(host, config.port, timeout).await {
      error!("failed to connect to {}: {}", host, e);
      return 2;
    }
  }

  let interrupted = tokio::select! {
    _ = engine.wait() => false,
    _ = tokio::signal::ctrl_c() => true
  };

  if interrupted {
    info!("interrupted; shutting down politely");
    engine.polite_shutdown();
    engine.wait().await;
  }

  if protocol_error.load(Ordering::Relaxed) { 2 } else { 0 }
}
