//! Command Source (spec §4.H): polls the two command tables and hands
//! rows to the Recipe Executor / Parameter Controller in FIFO arrival
//! order, with idempotent claiming so a crash-restart mid-processing
//! never double-executes a row.

use crate::controller::ParameterController;
use crate::coordination::EmergencyMonitor;
use crate::error::PlcResult;
use crate::recipe::RecipeExecutor;
use crate::store::{RecipeCommandRow, Store};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Drives the Parameter Controller (Terminal 3): poll, claim, hand off.
pub struct ParameterCommandSource {
    store: Arc<dyn Store>,
    controller: Arc<ParameterController>,
    machine_id: String,
    emergency: Arc<EmergencyMonitor>,
}

impl ParameterCommandSource {
    pub fn new(
        store: Arc<dyn Store>,
        controller: Arc<ParameterController>,
        machine_id: String,
        emergency: Arc<EmergencyMonitor>,
    ) -> Self {
        ParameterCommandSource {
            store,
            controller,
            machine_id,
            emergency,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            if let Err(e) = self.poll_once().await {
                warn!("parameter command poll failed: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> PlcResult<()> {
        if self.emergency.is_in_emergency_state() {
            debug!("parameter control commands refused: machine in emergency state");
            return Ok(());
        }
        let rows = self.store.poll_parameter_control_commands(&self.machine_id).await?;
        for row in rows {
            // `executed_at IS NULL` conditional claim (spec §4.H): if
            // the update affects zero rows, a peer claimed it first.
            if !self.store.claim_parameter_control_command(row.id).await? {
                debug!("parameter control command {} already claimed, skipping", row.id);
                continue;
            }
            self.controller.handle(row, None, None).await;
        }
        Ok(())
    }
}

/// The one recipe this terminal is currently walking, if any, along with
/// the cancel channel `stop_recipe` (or terminal shutdown) signals.
struct RunningExecution {
    process_execution_id: Uuid,
    cancel_tx: watch::Sender<bool>,
}

/// Drives the Recipe Executor (Terminal 2): poll, claim, and dispatch by
/// `command_type`. A `start_recipe` is run in a tracked background task
/// rather than awaited inline, so the poll loop keeps turning and can
/// observe a `stop_recipe` for the recipe it just started (spec §4.F
/// cancellation must preempt an in-flight execution, not just queue
/// behind it). Only one recipe runs at a time per terminal, matching the
/// single Modbus-owning socket upstream.
pub struct RecipeCommandSource {
    store: Arc<dyn Store>,
    executor: Arc<RecipeExecutor>,
    machine_id: String,
    emergency: Arc<EmergencyMonitor>,
    running: Mutex<Option<RunningExecution>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RecipeCommandSource {
    pub fn new(
        store: Arc<dyn Store>,
        executor: Arc<RecipeExecutor>,
        machine_id: String,
        emergency: Arc<EmergencyMonitor>,
    ) -> Arc<Self> {
        Arc::new(RecipeCommandSource {
            store,
            executor,
            machine_id,
            emergency,
            running: Mutex::new(None),
            task: Mutex::new(None),
        })
    }

    pub async fn run(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.poll_once().await {
                warn!("recipe command poll failed: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.cancel_running().await;
        self.join_running().await;
    }

    async fn poll_once(self: &Arc<Self>) -> PlcResult<()> {
        if self.emergency.is_in_emergency_state() {
            debug!("recipe commands refused: machine in emergency state");
            return Ok(());
        }
        let rows = self.store.poll_recipe_commands(&self.machine_id).await?;
        for row in rows {
            if !self.store.claim_recipe_command(row.id).await? {
                debug!("recipe command {} already claimed, skipping", row.id);
                continue;
            }
            match row.command_type.as_str() {
                "stop_recipe" => self.cancel_running().await,
                _ => self.spawn_start(row).await,
            }
        }
        Ok(())
    }

    /// Signals cancellation to whatever recipe is currently in flight, if
    /// any; a no-op if nothing is running.
    async fn cancel_running(&self) {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(r) => {
                info!("stop_recipe cancelling process execution {}", r.process_execution_id);
                let _ = r.cancel_tx.send(true);
            }
            None => debug!("stop_recipe received but no recipe is currently running"),
        }
    }

    async fn join_running(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn spawn_start(self: &Arc<Self>, row: RecipeCommandRow) {
        {
            let running = self.running.lock().await;
            if running.is_some() {
                warn!("recipe command {} ignored: another recipe is already running on this terminal", row.id);
                return;
            }
        }
        let recipe_id = match row.parameters.get("recipe_id").and_then(|v| v.as_str()).and_then(|s| Uuid::parse_str(s).ok()) {
            Some(id) => id,
            None => {
                warn!("recipe command {} missing/invalid recipe_id", row.id);
                return;
            }
        };
        let process_execution_id = match self
            .store
            .begin_process_execution(&self.machine_id, recipe_id, 1)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!("recipe command {} could not begin process execution: {e}", row.id);
                return;
            }
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        *self.running.lock().await = Some(RunningExecution {
            process_execution_id,
            cancel_tx,
        });

        let this = self.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = this.executor.execute(process_execution_id, recipe_id, cancel_rx).await {
                warn!("recipe command {} (process {process_execution_id}) failed: {e}", row.id);
            }
            *this.running.lock().await = None;
        });
        *self.task.lock().await = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataType;
    use crate::config::ByteOrder;
    use crate::plc::transport::Transport;
    use crate::plc::PlcCommunicator;
    use crate::recipe::RecipeExecutor;
    use crate::registry::Registry;
    use crate::store::dlq::DeadLetterQueue;
    use crate::store::writer::Writer;
    use crate::store::{ComponentParameterRow, MockStore, ParameterControlCommandRow, Recipe, RecipeCommandRow, RecipeStepRow};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn claimed_command_is_not_redelivered() {
        let mock = Arc::new(MockStore::new());
        let id = Uuid::new_v4();
        mock.seed_parameter_control_command(ParameterControlCommandRow {
            id,
            machine_id: None,
            parameter_name: Some("x".into()),
            component_parameter_id: None,
            target_value: 1.0,
            executed_at: None,
            completed_at: None,
            error_message: None,
        });

        let first = mock.poll_parameter_control_commands("m1").await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(mock.claim_parameter_control_command(id).await.unwrap());

        let second = mock.poll_parameter_control_commands("m1").await.unwrap();
        assert!(second.is_empty(), "claimed row must not be redelivered");
        assert!(!mock.claim_parameter_control_command(id).await.unwrap());
    }

    struct AlwaysOkTransport;

    #[async_trait]
    impl Transport for AlwaysOkTransport {
        async fn write(&self, _buf: &[u8]) -> PlcResult<()> {
            Ok(())
        }
        async fn read_exact(&self, buf: &mut [u8]) -> PlcResult<()> {
            let canned: [u8; 11] = [0, 0, 0, 0, 0, 5, 1, 3, 2, 0, 0];
            let n = buf.len().min(canned.len());
            buf[..n].copy_from_slice(&canned[..n]);
            Ok(())
        }
        async fn reconnect(&self) {}
    }

    /// A `stop_recipe` command arriving while a long purge step is in
    /// flight preempts it: the recipe ends `aborted`, not `completed`.
    #[tokio::test]
    async fn stop_recipe_command_cancels_the_in_flight_recipe() {
        let mock = Arc::new(MockStore::new());
        let purge_row = ComponentParameterRow {
            id: 1,
            parameter_name: "N2 Purge trigger".into(),
            component_name: "Gas Panel".into(),
            read_modbus_address: Some(20),
            write_modbus_address: Some(20),
            data_type: DataType::Bool,
            min_value: None,
            max_value: None,
            is_writable: true,
            unit: None,
        };
        let registry = Arc::new(Registry::build(vec![purge_row], &HashMap::new(), false));
        let transport = Arc::new(AlwaysOkTransport);
        let communicator: Arc<dyn crate::plc::PlcClient> =
            Arc::new(PlcCommunicator::new(transport, 1, ByteOrder::Badc));
        let store: Arc<dyn Store> = mock.clone();
        let dlq = Arc::new(DeadLetterQueue::new(std::env::temp_dir().join(format!(
            "aldctl-stop-recipe-test-{}",
            std::process::id()
        ))));
        let writer = Arc::new(Writer::start(store.clone(), dlq, StdDuration::from_secs(3600)));
        let emergency = Arc::new(EmergencyMonitor::new(store.clone()));
        let executor = Arc::new(RecipeExecutor::new(
            communicator,
            registry,
            store.clone(),
            writer,
            "m1".to_owned(),
            emergency.clone(),
        ));
        let source = RecipeCommandSource::new(store, executor, "m1".to_owned(), emergency);

        let recipe_id = Uuid::new_v4();
        mock.seed_recipe(
            Recipe {
                id: recipe_id,
                name: "long purge".into(),
                version: 1,
            },
            vec![RecipeStepRow {
                id: Uuid::new_v4(),
                recipe_id,
                sequence_number: 0,
                parent_step_id: None,
                step_type: "purge".into(),
                parameters: serde_json::json!({"gas_type": "N2", "duration_ms": 5000}),
            }],
        );
        mock.seed_recipe_command(RecipeCommandRow {
            id: Uuid::new_v4(),
            command_type: "start_recipe".into(),
            machine_id: Some("m1".into()),
            parameters: serde_json::json!({"recipe_id": recipe_id.to_string()}),
            created_at: chrono::Utc::now(),
            executed_at: None,
        });

        source.poll_once().await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(source.running.lock().await.is_some(), "recipe should still be running");

        mock.seed_recipe_command(RecipeCommandRow {
            id: Uuid::new_v4(),
            command_type: "stop_recipe".into(),
            machine_id: Some("m1".into()),
            parameters: serde_json::json!({"recipe_id": recipe_id.to_string()}),
            created_at: chrono::Utc::now(),
            executed_at: None,
        });
        source.poll_once().await.unwrap();
        source.join_running().await;

        let executions = mock.process_executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].1, "aborted");
    }
}
