mod cache;
mod config;
mod connectivity;
mod event;
mod http;
mod logging;
mod net;
mod notify;
mod queue;
mod router;
mod server;
mod sync;
mod worker;

#[cfg(test)]
mod test_support;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::cache::{NoopCache, ResponseCache, SqliteResponseCache};
use crate::config::Config;
use crate::connectivity::{Connectivity, ConnectivityMonitor};
use crate::event::{EventHandler, WorkerEvent};
use crate::net::UpstreamClient;
use crate::notify::{Clients, NotificationRelay};
use crate::queue::PendingQueue;
use crate::server::AppState;
use crate::worker::{Shared, Worker};

#[derive(Parser, Debug)]
#[command(name = "nutrition-sw")]
#[command(about = "Offline cache and background sync for the nutrition planner")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/nutrition-sw/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Origin server URL
  #[arg(short, long)]
  upstream: Option<String>,

  /// Address to listen on
  #[arg(short, long)]
  listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = Config::load(args.config.as_deref())?;

  // Command line wins over the file
  if let Some(upstream) = args.upstream {
    config.upstream = Some(upstream);
  }
  if let Some(listen) = args.listen {
    config.listen = listen;
  }

  let _log_guard = logging::init(&config.logging)?;

  if config.cache.enabled {
    let cache = SqliteResponseCache::open(&config.database_path()?)?;
    start(config, cache).await
  } else {
    info!("Response caching disabled");
    start(config, NoopCache).await
  }
}

async fn start<C: ResponseCache + 'static>(config: Config, cache: C) -> Result<()> {
  let origin = config.upstream_url()?;
  let network = UpstreamClient::new(origin.clone())?;
  let queue = PendingQueue::open(&config.database_path()?)?;

  let clients = Arc::new(Clients::new());
  let shared = Shared {
    queue: Arc::new(queue),
    // Assume online until the first probe says otherwise
    connectivity: Arc::new(Connectivity::new(true)),
    relay: Arc::new(NotificationRelay::new(
      config.notification_style(),
      Arc::clone(&clients),
    )),
    clients,
  };

  let events = EventHandler::new();
  let sender = events.sender();

  let (worker, worker_state) = Worker::new(
    network.clone(),
    Arc::new(cache),
    config.route_table(),
    config.precache.clone(),
    origin.clone(),
    shared.clone(),
  );
  tokio::spawn(worker.run(events));

  // Installation is the first thing the worker sees
  let _ = sender.send(WorkerEvent::Install);

  let probe_url = origin.join(&config.connectivity.probe_path)?;
  let monitor = ConnectivityMonitor::new(
    network.clone(),
    probe_url,
    config.connectivity.probe_interval(),
    Arc::clone(&shared.connectivity),
    sender.clone(),
  );
  tokio::spawn(monitor.run());

  let state = AppState {
    events: sender,
    upstream: network.origin().clone(),
    shared,
    worker_state,
  };

  server::serve(&config.listen, state, async {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutting down");
  })
  .await
}
