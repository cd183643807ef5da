use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use etcd_coord::CoordConfig;
use etcd_coord::Elect;
use etcd_coord::ElectEvent;
use etcd_coord::Error;
use etcd_coord::EtcdBackendForClient;
use etcd_coord::EtcdStore;
use etcd_coord::KvStore;
use etcd_coord::LeaseSessionClient;
use etcd_coord::ResourceEventHandler;
use etcd_coord::Result;
use serde_json::Value;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    let settings = CoordConfig::new()?.validate()?;

    // Initializing Logs
    let _guard = init_observability(&settings.log_dir)?;
    info!("starting with {:?}", settings);

    // Initializing Shutdown Signal
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = graceful_shutdown(shutdown).await {
                error!("Failed to shutdown: {:?}", e);
            }
        }
    });

    let store: Arc<dyn KvStore> = Arc::new(EtcdStore::connect(&settings.etcd).await?);
    let client = LeaseSessionClient::new(store.clone(), &settings.etcd).await?;

    // Leader election
    let election = if settings.election.key.is_empty() {
        info!("no election key configured, election disabled");
        None
    } else {
        let elect = Elect::new(store.clone(), &settings.etcd.namespace, &settings.election)?;
        let mut events = elect.subscribe(shutdown.clone());
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ElectEvent::Win => info!("became leader"),
                    ElectEvent::Lost => info!("lost leadership"),
                    ElectEvent::Init => {}
                }
            }
        });
        let campaign = tokio::spawn({
            let elect = elect.clone();
            let shutdown = shutdown.clone();
            async move { elect.start(shutdown).await }
        });
        Some(campaign)
    };

    // Change notification consumer
    let consumer = EtcdBackendForClient::new(client.clone(), &settings.informer);
    consumer.start_client_watch().await?;
    for keyword in &settings.informer.watch_resources {
        consumer
            .watch(keyword, Arc::new(LoggingHandler { keyword: keyword.clone() }))
            .await?;
    }

    info!("Application started. Waiting for CTRL+C signal...");
    shutdown.cancelled().await;

    for keyword in consumer.resources() {
        if let Err(e) = consumer.unwatch(&keyword).await {
            error!("unwatch {}: {:?}", keyword, e);
        }
    }
    if let Some(campaign) = election {
        campaign.await?;
    }
    if let Err(e) = client.close().await {
        error!("close session: {:?}", e);
    }

    println!("Exiting program.");
    Ok(())
}

/// Logs every change notification it receives
struct LoggingHandler {
    keyword: String,
}

impl ResourceEventHandler for LoggingHandler {
    fn on_add(
        &self,
        obj: &Value,
    ) {
        info!(keyword = %self.keyword, "add {}", obj);
    }

    fn on_update(
        &self,
        old_obj: &Value,
        new_obj: &Value,
    ) {
        info!(keyword = %self.keyword, "update {} -> {}", old_obj, new_obj);
    }

    fn on_delete(
        &self,
        obj: &Value,
    ) {
        info!(keyword = %self.keyword, "delete {}", obj);
    }
}

async fn graceful_shutdown(shutdown: CancellationToken) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(|e| Error::Fatal(format!("install SIGINT handler: {}", e)))?;
    let mut sigterm =
        signal(SignalKind::terminate()).map_err(|e| Error::Fatal(format!("install SIGTERM handler: {}", e)))?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
    }

    info!("Shutdown server..");
    shutdown.cancel();
    Ok(())
}

pub fn init_observability(log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir).map_err(|e| Error::Fatal(format!("create log dir {:?}: {}", log_dir, e)))?;
    let log_path = log_dir.join("coordd.log");
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map_err(|e| Error::Fatal(format!("open log file {:?}: {}", log_path, e)))?;

    let (non_blocking, guard) = tracing_appender::non_blocking(log_file);
    let base_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(base_subscriber).init();

    Ok(guard)
}
