use crate::config::Config;
use crate::event::{Event, EventHandler, NetworkStatus, Probe};
use crate::interceptor::Interceptor;
use crate::precache::{Catalog, PrecacheOrchestrator};
use crate::scope::ClinicScopeManager;
use crate::server;
use crate::store::SqliteStore;
use crate::sync::{ClientRegistry, OutboundQueue, QueueReplayer, SyncCoordinator, SyncOutcome, SyncTag};
use crate::transport::{HttpTransport, Transport, Upstream};
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Everything the proxy and the CLI commands share
pub struct App {
  pub config: Config,
  pub store: Arc<SqliteStore>,
  pub scope: ClinicScopeManager,
  pub queue: OutboundQueue,
  pub interceptor: Arc<Interceptor>,
  pub coordinator: Arc<SyncCoordinator>,
  pub precache: PrecacheOrchestrator,
  transport: Arc<dyn Transport>,
  upstream: Upstream,
  connectivity: watch::Sender<NetworkStatus>,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let store = Arc::new(SqliteStore::open(config.store.path.as_deref())?);
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(config.timeout())?);
    Self::with_parts(config, store, transport)
  }

  pub fn with_parts(config: Config, store: Arc<SqliteStore>, transport: Arc<dyn Transport>) -> Result<Self> {
    let upstream = Upstream::new(config.upstream_url()?, Config::get_api_token());
    let scope = ClinicScopeManager::new(store.clone());
    let queue = OutboundQueue::new(store.clone(), scope.clone());

    let interceptor = Arc::new(Interceptor::new(
      store.clone(),
      scope.clone(),
      transport.clone(),
      upstream.clone(),
      config.interceptor_settings(),
    ));

    let replayer = Arc::new(QueueReplayer::new(
      store.clone(),
      scope.clone(),
      transport.clone(),
      upstream.clone(),
      config.sync.replay_retry_budget,
    ));
    let coordinator = Arc::new(SyncCoordinator::new(
      store.clone(),
      ClientRegistry::new(),
      replayer,
      config.sync.retry,
    ));

    let precache = PrecacheOrchestrator::new(
      Catalog::with_overrides(&config.precache.categories),
      interceptor.clone(),
      scope.clone(),
    );

    let (connectivity, _) = watch::channel(NetworkStatus::Unknown);

    Ok(Self {
      config,
      store,
      scope,
      queue,
      interceptor,
      coordinator,
      precache,
      transport,
      upstream,
      connectivity,
    })
  }

  pub fn network_status(&self) -> NetworkStatus {
    *self.connectivity.borrow()
  }

  pub fn set_network_status(&self, status: NetworkStatus) {
    self.connectivity.send_replace(status);
  }

  /// Startup housekeeping: recover interrupted replays, pick the default
  /// clinic, install the app shell and activate.
  pub async fn prepare(&self) -> Result<()> {
    let requeued = self.store.requeue_interrupted()?;
    if requeued > 0 {
      info!(requeued, "requeued writes from an interrupted replay");
    }

    if let Some(clinic) = &self.config.default_clinic {
      if self.scope.active_clinic()?.is_none() {
        self.scope.set_active_clinic(clinic)?;
      }
    }

    if let Err(e) = self.interceptor.install().await {
      warn!("app shell not installed: {}", e);
    }

    if self.config.cache.skip_waiting {
      self.interceptor.activate()?;
    } else {
      info!("waiting for SKIP_WAITING before activating");
    }
    Ok(())
  }

  /// Replay `tag` once from the command line. Writes another process has in
  /// flight are left alone.
  pub async fn sync_now(&self, tag: SyncTag) -> Result<SyncOutcome> {
    self.coordinator.on_sync(tag).await
  }

  /// React to a sync signal. Failures are logged; the tags stay registered.
  pub async fn handle_event(&self, event: Event) {
    match event {
      Event::ConnectivityRestored => {
        self.set_network_status(NetworkStatus::Online);
        let clinic = match self.scope.active_clinic() {
          Ok(clinic) => clinic,
          Err(e) => {
            warn!("failed to read active clinic: {}", e);
            None
          }
        };
        match self.coordinator.on_connectivity_restored(clinic.as_deref()).await {
          Ok(results) => {
            for (tag, result) in results {
              if let Err(e) = result {
                warn!(tag = %tag, "sync failed: {:#}", e);
              }
            }
          }
          Err(e) => warn!("failed to fire sync tags: {}", e),
        }
      }
      Event::ConnectivityLost => {
        self.set_network_status(NetworkStatus::Offline);
        warn!("upstream unreachable, serving from cache");
      }
      Event::PeriodicSync => {
        if let Err(e) = self.coordinator.on_periodic_sync().await {
          warn!("periodic sync failed: {:#}", e);
        }
      }
    }
  }

  /// Run the proxy until Ctrl-C.
  pub async fn serve(self: Arc<Self>) -> Result<()> {
    self.prepare().await?;

    let probe = Probe::new(
      self.transport.clone(),
      self.upstream.clone(),
      self.config.sync.probe_path.clone(),
    );
    let mut events = EventHandler::new(
      probe,
      Duration::from_secs(self.config.sync.probe_interval_secs.max(1)),
      Duration::from_secs(self.config.sync.periodic_interval_secs.max(1)),
    );

    let mut status = events.status();
    let status_app = self.clone();
    tokio::spawn(async move {
      while status.changed().await.is_ok() {
        let observed = *status.borrow_and_update();
        status_app.set_network_status(observed);
      }
    });

    let sync_app = self.clone();
    tokio::spawn(async move {
      while let Some(event) = events.next().await {
        sync_app.handle_event(event).await;
      }
    });

    let addr = self.config.listen;
    let listener = tokio::net::TcpListener::bind(addr)
      .await
      .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;
    info!(%addr, upstream = %self.upstream.base(), "ocusync listening");

    axum::serve(listener, server::create_router(self.clone()))
      .with_graceful_shutdown(shutdown_signal())
      .await
      .map_err(|e| eyre!("Server error: {}", e))?;

    info!("ocusync stopped");
    Ok(())
  }
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    warn!("failed to listen for shutdown signal: {}", e);
  }
}
