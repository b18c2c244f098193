use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use stderrlog::Timestamp;
use tokio::signal;

use queue_router::batch::{BatchStore, KvPort, RedisKvStore};
use queue_router::broker::{AckOutcome, BrokerPort, Delivery, LapinBroker, QueueCallback};
use queue_router::class::ClassKind;
use queue_router::db_publisher::DbUpdatePublisher;
use queue_router::delay::DelayScheduler;
use queue_router::external::{Clock, SystemClock};
use queue_router::packet::MessagePacket;
use queue_router::registry::StageRegistry;
use queue_router::router::RouterCore;
use queue_router::ConfigLoader;

const MAX_CONNECT_RETRIES: u32 = 10;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("FATAL ERROR: {}", e);
        eprintln!("Error details: {:?}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    stderrlog::new()
        .verbosity(log::Level::Info)
        .timestamp(Timestamp::Millisecond)
        .show_module_names(true)
        .init()
        .unwrap();

    log::info!("=== Queue Router Worker Starting ===");
    log::info!("Process ID: {}", std::process::id());

    match dotenvy::dotenv() {
        Ok(_) => log::info!("Environment variables loaded from .env file"),
        Err(_) => log::info!("No .env file found, using system environment variables"),
    }

    let (settings, classes) = ConfigLoader::load()?;
    log::info!("Configuration loaded: {} classes", classes.len());

    let lapin = connect_broker_with_retry(&settings.amqp_url()).await?;
    let lapin = Arc::new(lapin);
    let broker_port: Arc<dyn BrokerPort> = lapin.clone();
    broker_port.declare_topology(&classes).await?;
    log::info!("Broker topology declared");

    let kv = connect_kv_with_retry(&settings.redis_url).await?;
    let kv: Arc<dyn KvPort> = Arc::new(kv);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let delay = Arc::new(DelayScheduler::new(broker_port.clone(), clock.clone(), settings.delay_exchange.clone()));
    let db = Arc::new(DbUpdatePublisher::new(
        broker_port.clone(),
        settings.db_updates_exchange.clone(),
        settings.db_updates_queue_prefix.clone(),
        settings.db_update_shards,
    ));
    // Held for its side effect of being wired into stage callbacks once those
    // are plugged in; the worker binary itself never reads batch state.
    let _batch_store = BatchStore::new(kv, delay.clone(), clock.clone(), settings.dlr_exchange.clone(), settings.dlr_route.clone());

    let classes = Arc::new(classes);
    let core = RouterCore::new(
        classes.clone(),
        broker_port.clone(),
        delay,
        db,
        clock,
        settings.cargo_key.clone(),
        settings.settings_key.clone(),
    );

    let stages = Arc::new(StageRegistry::new());
    log::warn!("worker: no stage callbacks registered; this binary ships the router core only — plug in stage implementations before running in production");

    let mut callbacks: HashMap<String, Arc<dyn QueueCallback>> = HashMap::new();
    for class in classes.classes() {
        if class.kind() == ClassKind::Notify {
            continue;
        }
        let Some(queue) = class.queue.clone() else { continue };
        callbacks.insert(
            queue,
            Arc::new(RouterQueueCallback {
                class_name: class.name.clone(),
                core: core.clone(),
                stages: stages.clone(),
            }),
        );
    }
    log::info!("worker: consuming {} queues", callbacks.len());

    let max_consume: Option<u64> = std::env::var("MAX_CONSUME").ok().and_then(|v| v.parse().ok());
    if let Some(n) = max_consume {
        log::info!("worker: debug max_consume={} enabled", n);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    lapin.consume_poll(callbacks, max_consume, shutdown_rx).await?;

    log::info!("worker: consume loop ended, shutting down");
    Ok(())
}

/// One callback per declared queue, dispatching decoded packets into the
/// class's registered stage. Ack policy (§7): a malformed payload acks and
/// logs (it can never become processable by redelivery); a stage reporting
/// `Err` is a transport-level failure and is requeued, never silently
/// dropped — business-level failures are expected to have already been
/// turned into a `publishAbort` call before the stage returns `Ok`.
struct RouterQueueCallback {
    class_name: String,
    core: RouterCore,
    stages: Arc<StageRegistry>,
}

#[async_trait::async_trait]
impl QueueCallback for RouterQueueCallback {
    async fn on_delivery(&self, delivery: Delivery) -> AckOutcome {
        let packet = match MessagePacket::decode(&delivery.body, self.core.cargo_key(), self.core.settings_key()) {
            Ok(p) => p,
            Err(e) => {
                log::error!("worker: malformed payload on {}: {}", self.class_name, e);
                return AckOutcome::Ack;
            }
        };

        let Some(stage) = self.stages.get(&self.class_name) else {
            log::error!("worker: no stage registered for class {}", self.class_name);
            return AckOutcome::Ack;
        };

        match stage.process(self.core.clone(), packet).await {
            Ok(()) => AckOutcome::Ack,
            Err(e) => {
                log::error!("worker: stage {} failed: {}", self.class_name, e);
                AckOutcome::Requeue
            }
        }
    }
}

/// Exponential backoff on initial connect, grounded in
/// `database::create_pool`'s retry loop (§2.2) — a worker dialing three
/// backing services at startup cannot assume the first dial succeeds.
async fn connect_broker_with_retry(amqp_url: &str) -> anyhow::Result<LapinBroker> {
    let mut attempt = 0;
    loop {
        match LapinBroker::connect(amqp_url).await {
            Ok(broker) => return Ok(broker),
            Err(e) if attempt < MAX_CONNECT_RETRIES => {
                attempt += 1;
                let backoff = Duration::from_millis(500 * 2u64.pow(attempt.min(6)));
                log::warn!("worker: broker connect attempt {} failed ({}), retrying in {:?}", attempt, e, backoff);
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(anyhow::anyhow!("broker connect failed after {} attempts: {}", attempt, e)),
        }
    }
}

async fn connect_kv_with_retry(redis_url: &str) -> anyhow::Result<RedisKvStore> {
    let mut attempt = 0;
    loop {
        match RedisKvStore::connect(redis_url).await {
            Ok(store) => return Ok(store),
            Err(e) if attempt < MAX_CONNECT_RETRIES => {
                attempt += 1;
                let backoff = Duration::from_millis(500 * 2u64.pow(attempt.min(6)));
                log::warn!("worker: kv connect attempt {} failed ({}), retrying in {:?}", attempt, e, backoff);
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(anyhow::anyhow!("kv connect failed after {} attempts: {}", attempt, e)),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("worker: received Ctrl+C, shutting down gracefully...");
        },
        _ = terminate => {
            log::info!("worker: received terminate signal, shutting down gracefully...");
        },
    }
}

