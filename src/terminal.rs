//! Terminal composition root (spec §2): wires the shared building
//! blocks (B Communicator, C Registry, D Writer) into each terminal's
//! role-specific pair (E+Logger, F+Recipe, G+Controller) and drives the
//! run loop until SIGTERM/SIGINT.

use crate::commands::{ParameterCommandSource, RecipeCommandSource};
use crate::config::Config;
use crate::controller::ParameterController;
use crate::coordination::{EmergencyMonitor, PlcLease};
use crate::error::{PlcError, PlcResult};
use crate::logger::ContinuousLogger;
use crate::plc::discovery::{self, DiscoveryCache};
use crate::plc::queue::{PlcOperationDrain, QueuedPlcClient};
use crate::plc::transport::TcpTransport;
use crate::plc::{PlcClient, PlcCommunicator};
use crate::recipe::RecipeExecutor;
use crate::registry::Registry;
use crate::store::dlq::DeadLetterQueue;
use crate::store::writer::Writer;
use crate::store::{PostgresStore, Store};
use log::info;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);
const DISCOVERY_CACHE_TTL: Duration = Duration::from_secs(3600);
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Resolves the PLC's socket address per the configured connect mode,
/// falling back through hostname resolution and a subnet sweep when
/// `PLC_MODE=auto`.
async fn resolve_plc_addr(config: &Config) -> PlcResult<SocketAddr> {
    match config.plc_mode {
        crate::config::PlcConnectMode::Static => {
            let ip: IpAddr = config
                .plc_ip
                .as_deref()
                .ok_or_else(|| PlcError::fatal("PLC_IP missing for static connect mode"))?
                .parse()
                .map_err(|e| PlcError::fatal(format!("invalid PLC_IP: {e}")))?;
            Ok(SocketAddr::new(ip, config.plc_port))
        }
        crate::config::PlcConnectMode::Hostname => {
            let hostname = config
                .plc_hostname
                .as_deref()
                .ok_or_else(|| PlcError::fatal("PLC_HOSTNAME missing for hostname connect mode"))?;
            let ip = discovery::resolve_hostname(hostname, config.plc_port, DISCOVERY_TIMEOUT)
                .await?
                .ok_or_else(|| PlcError::fatal(format!("could not resolve {hostname}")))?;
            Ok(SocketAddr::new(ip, config.plc_port))
        }
        crate::config::PlcConnectMode::AutoDiscover => {
            let cache = DiscoveryCache::new(
                crate::var_dir().join(format!("{}.plc_cache.json", config.machine_id)),
                DISCOVERY_CACHE_TTL,
            );
            let now_unix = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            let local_ip = config
                .plc_ip
                .as_deref()
                .and_then(|s| s.parse::<Ipv4Addr>().ok());
            let ip = discovery::discover(
                &cache,
                config.plc_hostname.as_deref(),
                local_ip,
                config.plc_port,
                DISCOVERY_TIMEOUT,
                now_unix,
            )
            .await?
            .ok_or_else(|| PlcError::fatal("auto-discovery found no responding PLC"))?;
            Ok(SocketAddr::new(ip, config.plc_port))
        }
    }
}

async fn build_communicator(config: &Config) -> PlcResult<Arc<PlcCommunicator>> {
    let addr = resolve_plc_addr(config).await?;
    info!("connecting to PLC at {addr}");
    let transport = Arc::new(TcpTransport::new(addr, DISCOVERY_TIMEOUT));
    Ok(Arc::new(PlcCommunicator::new(
        transport,
        config.plc_slave_id,
        config.plc_byte_order,
    )))
}

async fn build_registry(store: &Arc<dyn Store>, config: &Config) -> PlcResult<Arc<Registry>> {
    let rows = store.load_component_parameters().await?;
    Ok(Arc::new(Registry::build(
        rows,
        &std::collections::HashMap::new(),
        config.essentials_only,
    )))
}

fn build_writer(store: Arc<dyn Store>, config: &Config) -> Arc<Writer> {
    let dlq = Arc::new(DeadLetterQueue::new(config.dlq_dir.clone()));
    Arc::new(Writer::start(store, dlq, config.dlq_replay_interval))
}

/// `Writer::stop` consumes the writer by value to join its background
/// tasks; by the time this is called every other `Arc<Writer>` clone
/// held by this terminal's components has already been dropped, so the
/// unwrap always succeeds.
async fn stop_writer(writer: Arc<Writer>) {
    match Arc::try_unwrap(writer) {
        Ok(writer) => writer.stop().await,
        Err(_) => log::warn!("writer still shared at shutdown, skipping graceful stop"),
    }
}

/// Blocks until `crate::sigterm_received()` flips, polling at a cadence
/// cheap enough not to matter next to the sub-second loops it watches
/// over.
async fn wait_for_shutdown() {
    while !crate::sigterm_received() {
        tokio::time::sleep(SHUTDOWN_POLL).await;
    }
}

/// Terminal 1: PLC Data Collector. Owns the only Modbus socket in the
/// fleet, holds the PLC exclusivity lease, and runs the Continuous
/// Logger and the emergency poller.
pub async fn run_logger_terminal(config: Config) -> PlcResult<()> {
    let store: Arc<dyn Store> = Arc::new(PostgresStore::connect(&config.database_url).await?);
    let registry = build_registry(&store, &config).await?;
    let communicator = build_communicator(&config).await?;
    let writer = build_writer(store.clone(), &config);

    let lease = PlcLease::new(store.clone(), format!("{}-terminal1", config.machine_id));
    lease.acquire().await?;

    let (lease_shutdown_tx, lease_shutdown_rx) = watch::channel(false);
    let lease_task = {
        let lease = Arc::new(lease);
        let lease_for_task = lease.clone();
        tokio::spawn(async move { lease_for_task.run_heartbeat(lease_shutdown_rx).await })
    };

    let emergency = Arc::new(EmergencyMonitor::new(store.clone()));
    let (emergency_shutdown_tx, emergency_shutdown_rx) = watch::channel(false);
    let emergency_task = {
        let emergency = emergency.clone();
        tokio::spawn(async move { emergency.run(emergency_shutdown_rx).await })
    };

    // Terminal 1 is the sole Modbus socket owner (spec §4.I, invariant
    // P4): this drain is what lets Terminals 2 and 3 reach the PLC at
    // all, servicing the valve_ops/parameter_ops rows they queue.
    let (drain_shutdown_tx, drain_shutdown_rx) = watch::channel(false);
    let drain_task = {
        let drain = PlcOperationDrain::new(communicator.clone(), store.clone());
        tokio::spawn(async move { drain.run(drain_shutdown_rx).await })
    };

    let logger = ContinuousLogger::new(
        communicator,
        registry,
        store,
        writer.clone(),
        config.machine_id.clone(),
        emergency,
    );
    logger.start().await;

    wait_for_shutdown().await;
    info!("terminal 1 (logger) shutting down");

    logger.stop().await;
    drop(logger);
    let _ = drain_shutdown_tx.send(true);
    let _ = drain_task.await;
    let _ = emergency_shutdown_tx.send(true);
    let _ = emergency_task.await;
    let _ = lease_shutdown_tx.send(true);
    let _ = lease_task.await;
    stop_writer(writer).await;
    Ok(())
}

/// Terminal 2: Recipe Executor. Never opens a Modbus socket of its own
/// (spec §4.I, invariant P4): every PLC operation a recipe step needs
/// goes through a `QueuedPlcClient`, which submits a row to
/// `valve_ops`/`parameter_ops` for Terminal 1's drain to service.
pub async fn run_recipe_terminal(config: Config) -> PlcResult<()> {
    let store: Arc<dyn Store> = Arc::new(PostgresStore::connect(&config.database_url).await?);
    let registry = build_registry(&store, &config).await?;
    let writer = build_writer(store.clone(), &config);

    let plc: Arc<dyn PlcClient> = Arc::new(QueuedPlcClient::new(
        store.clone(),
        format!("{}-terminal2", config.machine_id),
    ));

    let emergency = Arc::new(EmergencyMonitor::new(store.clone()));
    let (emergency_shutdown_tx, emergency_shutdown_rx) = watch::channel(false);
    let emergency_task = {
        let emergency = emergency.clone();
        tokio::spawn(async move { emergency.run(emergency_shutdown_rx).await })
    };

    let executor = Arc::new(RecipeExecutor::new(
        plc,
        registry,
        store.clone(),
        writer.clone(),
        config.machine_id.clone(),
        emergency.clone(),
    ));

    let source = RecipeCommandSource::new(store, executor, config.machine_id.clone(), emergency);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let source_task = {
        let source = source.clone();
        tokio::spawn(async move { source.run(shutdown_rx).await })
    };

    wait_for_shutdown().await;
    info!("terminal 2 (recipe) shutting down");

    let _ = shutdown_tx.send(true);
    let _ = source_task.await;
    drop(source);
    let _ = emergency_shutdown_tx.send(true);
    let _ = emergency_task.await;
    stop_writer(writer).await;
    Ok(())
}

/// Terminal 3: Parameter Controller. Same exclusivity rule as Terminal
/// 2: every write/read reaches the PLC only via a queued operation
/// serviced by Terminal 1, never through a socket of its own.
pub async fn run_commands_terminal(config: Config) -> PlcResult<()> {
    let store: Arc<dyn Store> = Arc::new(PostgresStore::connect(&config.database_url).await?);
    let registry = build_registry(&store, &config).await?;

    let plc: Arc<dyn PlcClient> = Arc::new(QueuedPlcClient::new(
        store.clone(),
        format!("{}-terminal3", config.machine_id),
    ));

    let emergency = Arc::new(EmergencyMonitor::new(store.clone()));
    let (emergency_shutdown_tx, emergency_shutdown_rx) = watch::channel(false);
    let emergency_task = {
        let emergency = emergency.clone();
        tokio::spawn(async move { emergency.run(emergency_shutdown_rx).await })
    };

    let controller = Arc::new(ParameterController::new(plc, registry, store.clone(), emergency.clone()));
    let source = Arc::new(ParameterCommandSource::new(
        store,
        controller,
        config.machine_id.clone(),
        emergency.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let source_task = {
        let source = source.clone();
        tokio::spawn(async move { source.run(shutdown_rx).await })
    };

    wait_for_shutdown().await;
    info!("terminal 3 (commands) shutting down");

    let _ = shutdown_tx.send(true);
    let _ = source_task.await;
    let _ = emergency_shutdown_tx.send(true);
    let _ = emergency_task.await;
    Ok(())
}

/// Dispatches to the terminal selected in `config`.
pub async fn run(config: Config) -> PlcResult<()> {
    match config.terminal {
        crate::config::Terminal::Logger => run_logger_terminal(config).await,
        crate::config::Terminal::Recipe => run_recipe_terminal(config).await,
        crate::config::Terminal::Commands => run_commands_terminal(config).await,
    }
}
