//! Continuous Logger (spec §4.E) — the 1 Hz dual-mode sampling loop.
//!
//! Snapshots every known parameter on a `DeadlineLoop` tick and routes
//! the samples into the Audit & History Writer. Mode (idle vs
//! processing) comes from a cached machine-state read so a busy cycle
//! doesn't stampede the store. Grounded on the same start/stop
//! idempotence and task-tracking discipline as `store::writer::Writer`.

use crate::codec::{DataType, RawValue};
use crate::coordination::EmergencyMonitor;
use crate::plc::PlcCommunicator;
use crate::registry::Registry;
use crate::store::{MachineState, MachineStatus, ParameterHistorySample, ProcessDataPoint, Store};
use crate::store::writer::Writer;
use chrono::Utc;
use log::{debug, error, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const TICK_INTERVAL: Duration = Duration::from_secs(1);
const STATE_CACHE_TTL: Duration = Duration::from_secs(1);

struct CachedState {
    fetched_at: Instant,
    state: MachineState,
}

pub struct ContinuousLogger {
    communicator: Arc<PlcCommunicator>,
    registry: Arc<Registry>,
    store: Arc<dyn Store>,
    writer: Arc<Writer>,
    machine_id: String,
    emergency: Arc<EmergencyMonitor>,
    emergency_handled: AtomicBool,
    cached_state: Mutex<Option<CachedState>>,
    error_count: AtomicU64,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ContinuousLogger {
    pub fn new(
        communicator: Arc<PlcCommunicator>,
        registry: Arc<Registry>,
        store: Arc<dyn Store>,
        writer: Arc<Writer>,
        machine_id: String,
        emergency: Arc<EmergencyMonitor>,
    ) -> Arc<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Arc::new(ContinuousLogger {
            communicator,
            registry,
            store,
            writer,
            machine_id,
            emergency,
            emergency_handled: AtomicBool::new(false),
            cached_state: Mutex::new(None),
            error_count: AtomicU64::new(0),
            handle: Mutex::new(None),
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Idempotent: a second call while the loop is already running is a
    /// no-op.
    pub async fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().await;
        if handle.is_some() {
            return;
        }
        let _ = self.shutdown_tx.send(false);
        let logger = self.clone();
        *handle = Some(tokio::spawn(async move { logger.run().await }));
    }

    /// Cancels the loop cooperatively and waits for the in-flight cycle
    /// to finish before returning.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let mut handle = self.handle.lock().await;
        if let Some(h) = handle.take() {
            let _ = h.await;
        }
    }

    async fn run(self: Arc<Self>) {
        let mut loop_clock = crate::scheduler::DeadlineLoop::with_label(TICK_INTERVAL, "continuous_logger").reporting();
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = loop_clock.tick() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
            if *shutdown.borrow() {
                return;
            }
            self.run_cycle().await;
        }
    }

    async fn cached_machine_state(&self) -> crate::error::PlcResult<MachineState> {
        {
            let cached = self.cached_state.lock().await;
            if let Some(c) = cached.as_ref() {
                if c.fetched_at.elapsed() < STATE_CACHE_TTL {
                    return Ok(c.state.clone());
                }
            }
        }
        let state = self.store.get_machine_state(&self.machine_id).await?;
        let mut cached = self.cached_state.lock().await;
        *cached = Some(CachedState {
            fetched_at: Instant::now(),
            state: state.clone(),
        });
        Ok(state)
    }

    /// One cycle of the pipeline described in §4.E: read state, snapshot
    /// every parameter, route into the writer. Any read failure aborts
    /// the whole cycle rather than submitting a partial snapshot.
    pub async fn run_cycle(&self) {
        if self.emergency.is_in_emergency_state() {
            if !self.emergency_handled.swap(true, Ordering::SeqCst) {
                self.drive_outputs_safe().await;
            }
        } else {
            self.emergency_handled.store(false, Ordering::SeqCst);
        }

        let state = match self.cached_machine_state().await {
            Ok(s) => s,
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                warn!("continuous logger could not read machine state: {e}");
                return;
            }
        };

        let samples = match self.read_all_parameters().await {
            Ok(s) => s,
            Err(e) => {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                warn!("continuous logger cycle failed reading PLC: {e}");
                return;
            }
        };

        let timestamp = Utc::now();
        for (parameter_id, value) in &samples {
            self.writer.submit_history(ParameterHistorySample {
                parameter_id: *parameter_id,
                value: *value,
                timestamp,
                machine_id: self.machine_id.clone(),
            });
        }

        if state.status == MachineStatus::Processing {
            // Mode-transition race (§4.E): `current_process_id` read here
            // can be stale by the time this cycle's batch is assembled.
            // A null process_id must never reach `process_data_points`,
            // so a transition that clears it just drops this cycle's
            // dual-write instead of guessing.
            if let Some(process_id) = state.current_process_id {
                for (parameter_id, value) in &samples {
                    self.writer.submit_data_point(ProcessDataPoint {
                        process_id,
                        parameter_id: *parameter_id,
                        value: *value,
                        set_point: None,
                        timestamp,
                    });
                }
            } else {
                debug!("machine status processing but current_process_id is null, skipping dual-write");
            }
        }
    }

    async fn read_all_parameters(&self) -> crate::error::PlcResult<Vec<(i64, f64)>> {
        let targets: Vec<(i64, u16, DataType, Option<crate::registry::ScalingRecord>)> = self
            .registry
            .all_parameters()
            .filter_map(|p| p.read_address.map(|address| (p.id, address, p.data_type, p.scaling)))
            .collect();
        let requests: Vec<(u16, DataType)> = targets.iter().map(|(_, address, ty, _)| (*address, *ty)).collect();
        let values = self.communicator.read_all(&requests).await?;
        Ok(targets
            .into_iter()
            .zip(values)
            .map(|((parameter_id, _, _, scaling), raw)| (parameter_id, engineering_value(&raw, scaling)))
            .collect())
    }

    /// §4.I reaction (ii): drive every owned output to a safe state.
    /// Runs once per emergency episode (edge-triggered by
    /// `emergency_handled`) rather than every tick, since closing an
    /// already-closed valve is harmless but would otherwise flood the
    /// PLC with writes for as long as the emergency persists.
    async fn drive_outputs_safe(&self) {
        warn!("emergency state detected: driving valves and purge trigger closed");
        for valve in self.registry.all_valves() {
            if let Err(e) = self.communicator.write_coil(valve.coil_address, false).await {
                error!("failed to close valve {} during emergency response: {e}", valve.number);
            }
        }
        if let Ok(purge) = self.registry.purge_trigger() {
            if let Some(address) = purge.write_address {
                if let Err(e) = self.communicator.write_coil(address, false).await {
                    error!("failed to close purge trigger during emergency response: {e}");
                }
            }
        }
    }
}

fn engineering_value(raw: &RawValue, scaling: Option<crate::registry::ScalingRecord>) -> f64 {
    match (raw, scaling) {
        (RawValue::Bool(b), _) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        (other, Some(scaling)) => scaling.to_engineering_units(other.as_f64()),
        (other, None) => other.as_f64(),
    }
}
