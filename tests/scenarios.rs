//! End-to-end scenario tests against `MockStore` and stub Modbus
//! transports, covering the seed scenarios for recipe execution, dual
//! mode logging, broken-pipe recovery, out-of-range rejection, and
//! emergency propagation.

use aldctl::codec::DataType;
use aldctl::commands::{ParameterCommandSource, RecipeCommandSource};
use aldctl::config::ByteOrder;
use aldctl::controller::ParameterController;
use aldctl::coordination::EmergencyMonitor;
use aldctl::error::PlcResult;
use aldctl::logger::ContinuousLogger;
use aldctl::plc::transport::Transport;
use aldctl::plc::{PlcClient, PlcCommunicator};
use aldctl::recipe::RecipeExecutor;
use aldctl::registry::Registry;
use aldctl::store::writer::Writer;
use aldctl::store::{
    ComponentParameterRow, MachineState, MachineStatus, MockStore, ParameterControlCommandRow,
    Recipe, RecipeCommandRow, RecipeStepRow, Store,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

/// Always answers with a well-formed write-confirmation frame,
/// regardless of what was written; good enough for coil/register writes
/// where the tests assert on audit rows rather than wire bytes.
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

fn valve_row(id: i64, number: u32, coil: u16) -> ComponentParameterRow {
    ComponentParameterRow {
        id,
        parameter_name: format!("Valve {number} state"),
        component_name: format!("Valve {number}"),
        read_modbus_address: Some(coil),
        write_modbus_address: Some(coil),
        data_type: DataType::Bool,
        min_value: None,
        max_value: None,
        is_writable: true,
        unit: None,
    }
}

fn purge_row(id: i64, coil: u16) -> ComponentParameterRow {
    ComponentParameterRow {
        id,
        parameter_name: "N2 Purge trigger".to_owned(),
        component_name: "Gas Panel".to_owned(),
        read_modbus_address: Some(coil),
        write_modbus_address: Some(coil),
        data_type: DataType::Bool,
        min_value: None,
        max_value: None,
        is_writable: true,
        unit: None,
    }
}

fn step(id: Uuid, recipe_id: Uuid, seq: i32, parent: Option<Uuid>, kind: &str, params: serde_json::Value) -> RecipeStepRow {
    RecipeStepRow {
        id,
        recipe_id,
        sequence_number: seq,
        parent_step_id: parent,
        step_type: kind.to_owned(),
        parameters: params,
    }
}

fn build_executor() -> (Arc<MockStore>, Arc<RecipeExecutor>, Arc<Writer>) {
    let mock = Arc::new(MockStore::new());
    mock.seed_parameters(vec![valve_row(1, 1, 10), purge_row(2, 20)]);
    let registry = Arc::new(Registry::build(vec![valve_row(1, 1, 10), purge_row(2, 20)], &HashMap::new(), false));
    let transport = Arc::new(AlwaysOkTransport);
    let communicator: Arc<dyn PlcClient> = Arc::new(PlcCommunicator::new(transport, 1, ByteOrder::Badc));
    let store: Arc<dyn Store> = mock.clone();
    let dlq = Arc::new(aldctl::store::dlq::DeadLetterQueue::new(std::env::temp_dir().join("aldctl-scenario-dlq")));
    let writer = Arc::new(Writer::start(store.clone(), dlq, Duration::from_secs(3600)));
    let emergency = Arc::new(EmergencyMonitor::new(store.clone()));
    let executor = Arc::new(RecipeExecutor::new(communicator, registry, store, writer.clone(), "m1".to_owned(), emergency));
    (mock, executor, writer)
}

/// Scenario 1: a simple valve-open, purge, valve-close recipe produces
/// three audit rows in order, the last with target_value 0.0.
#[tokio::test]
async fn simple_recipe_produces_three_ordered_audit_rows() {
    let (mock, executor, writer) = build_executor();
    let recipe_id = Uuid::new_v4();
    mock.seed_recipe(
        Recipe { id: recipe_id, name: "simple".into(), version: 1 },
        vec![
            step(Uuid::new_v4(), recipe_id, 0, None, "valve", serde_json::json!({"valve_number": 1, "state": "open", "duration_ms": 50})),
            step(Uuid::new_v4(), recipe_id, 1, None, "purge", serde_json::json!({"gas_type": "N2", "duration_ms": 50})),
            step(Uuid::new_v4(), recipe_id, 2, None, "valve", serde_json::json!({"valve_number": 1, "state": "close", "duration_ms": 0})),
        ],
    );

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let process_id = mock.begin_process_execution("m1", recipe_id, 1).await.unwrap();
    executor.execute(process_id, recipe_id, cancel_rx).await.unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    let _ = &writer;

    let mut records = mock.audit_records();
    records.sort_by_key(|r| r.executed_at);
    assert_eq!(records.len(), 3, "expected 3 audit rows, got {records:?}");
    assert_eq!(records.last().unwrap().target_value, 0.0);
}

/// Scenario 2: a loop(count=3) over two child steps unrolls to one
/// audit row per executed iteration, in unrolled order.
#[tokio::test]
async fn loop_recipe_unrolls_into_one_audit_row_per_iteration() {
    let (mock, executor, writer) = build_executor();
    let recipe_id = Uuid::new_v4();
    let loop_id = Uuid::new_v4();
    mock.seed_recipe(
        Recipe { id: recipe_id, name: "loop".into(), version: 1 },
        vec![
            step(loop_id, recipe_id, 0, None, "loop", serde_json::json!({"count": 3})),
            step(Uuid::new_v4(), recipe_id, 1, Some(loop_id), "valve", serde_json::json!({"valve_number": 1, "state": "pulse", "duration_ms": 10})),
            step(Uuid::new_v4(), recipe_id, 2, Some(loop_id), "purge", serde_json::json!({"gas_type": "N2", "duration_ms": 10})),
        ],
    );

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let process_id = mock.begin_process_execution("m1", recipe_id, 1).await.unwrap();
    executor.execute(process_id, recipe_id, cancel_rx).await.unwrap();
    tokio::time::sleep(Duration::from_millis(700)).await;
    let _ = &writer;

    assert_eq!(mock.audit_records().len(), 6, "two steps x 3 iterations");
}

/// Scenario 5: an out-of-range parameter write is completed with an
/// error message and never reaches the PLC.
#[tokio::test]
async fn out_of_range_write_is_rejected_without_a_plc_write() {
    let mock = Arc::new(MockStore::new());
    let registry = Arc::new(Registry::build(
        vec![ComponentParameterRow {
            id: 9,
            parameter_name: "Temperature".into(),
            component_name: "Zone 1".into(),
            read_modbus_address: Some(30),
            write_modbus_address: Some(30),
            data_type: DataType::U16,
            min_value: Some(0.0),
            max_value: Some(600.0),
            is_writable: true,
            unit: Some("C".into()),
        }],
        &HashMap::new(),
        false,
    ));
    let write_attempted = Arc::new(AtomicBool::new(false));
    struct TrackingTransport(Arc<AtomicBool>);
    #[async_trait]
    impl Transport for TrackingTransport {
        async fn write(&self, _buf: &[u8]) -> PlcResult<()> {
            self.0.store(true, Ordering::SeqCst);
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
    let transport = Arc::new(TrackingTransport(write_attempted.clone()));
    let communicator: Arc<dyn PlcClient> = Arc::new(PlcCommunicator::new(transport, 1, ByteOrder::Badc));
    let store: Arc<dyn Store> = mock.clone();
    let emergency = Arc::new(EmergencyMonitor::new(store.clone()));
    let controller = Arc::new(ParameterController::new(communicator, registry, store.clone(), emergency.clone()));
    let source = Arc::new(ParameterCommandSource::new(store, controller, "m1".to_owned(), emergency));

    let id = Uuid::new_v4();
    mock.seed_parameter_control_command(ParameterControlCommandRow {
        id,
        machine_id: Some("m1".into()),
        parameter_name: Some("Temperature".into()),
        component_parameter_id: None,
        target_value: 9999.0,
        executed_at: None,
        completed_at: None,
        error_message: None,
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = {
        let source = source.clone();
        tokio::spawn(async move { source.run(shutdown_rx).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let _ = shutdown_tx.send(true);
    let _ = handle.await;

    let row = mock.parameter_control_commands().into_iter().find(|r| r.id == id).unwrap();
    assert!(row.executed_at.is_some());
    assert!(row.completed_at.is_some());
    assert!(row.error_message.as_deref().unwrap_or_default().contains("out of range"));
    assert!(!write_attempted.load(Ordering::SeqCst), "no Modbus write should have been attempted");
}

/// Records every write PDU sent over the wire so a test can inspect the
/// function code / address / value a `PlcCommunicator` actually issued,
/// rather than only asserting on store-side audit rows.
struct RecordingTransport {
    writes: std::sync::Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn write(&self, buf: &[u8]) -> PlcResult<()> {
        self.writes.lock().unwrap().push(buf.to_vec());
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

fn wrote_coil_closed(writes: &[Vec<u8>], coil_address: u16) -> bool {
    writes.iter().any(|buf| {
        buf.len() >= 12
            && buf[7] == 0x05
            && u16::from_be_bytes([buf[8], buf[9]]) == coil_address
            && buf[10] == 0x00
            && buf[11] == 0x00
    })
}

/// Scenario 6: an emergency signal flips the shared flag within a few
/// poll cycles, Terminal 1 drives its valves closed, a recipe command
/// submitted while the flag is set is refused, and a reset clears the
/// flag and lets commands resume.
#[tokio::test]
async fn emergency_signal_propagates_and_clears_on_reset() {
    let mock = Arc::new(MockStore::new());
    let store: Arc<dyn Store> = mock.clone();
    let monitor = Arc::new(EmergencyMonitor::new(store.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.run(shutdown_rx).await })
    };

    let valve = valve_row(1, 1, 10);
    mock.seed_parameters(vec![valve.clone()]);
    let registry = Arc::new(Registry::build(vec![valve], &HashMap::new(), false));
    let transport = Arc::new(RecordingTransport { writes: std::sync::Mutex::new(Vec::new()) });
    let communicator = Arc::new(PlcCommunicator::new(transport.clone(), 1, ByteOrder::Badc));
    let dlq = Arc::new(aldctl::store::dlq::DeadLetterQueue::new(std::env::temp_dir().join("aldctl-scenario-dlq-emergency")));
    let writer = Arc::new(Writer::start(store.clone(), dlq, Duration::from_secs(3600)));
    let logger = ContinuousLogger::new(communicator.clone(), registry.clone(), store.clone(), writer.clone(), "m1".to_owned(), monitor.clone());

    let plc: Arc<dyn PlcClient> = communicator.clone();
    let executor = Arc::new(RecipeExecutor::new(plc, registry, store.clone(), writer.clone(), "m1".to_owned(), monitor.clone()));
    let source = RecipeCommandSource::new(store.clone(), executor, "m1".to_owned(), monitor.clone());

    let recipe_id = Uuid::new_v4();
    mock.seed_recipe(
        Recipe { id: recipe_id, name: "during-emergency".into(), version: 1 },
        vec![step(
            Uuid::new_v4(),
            recipe_id,
            0,
            None,
            "valve",
            serde_json::json!({"valve_number": 1, "state": "open", "duration_ms": 0}),
        )],
    );
    let command_id = Uuid::new_v4();
    mock.seed_recipe_command(RecipeCommandRow {
        id: command_id,
        command_type: "start_recipe".into(),
        machine_id: Some("m1".into()),
        parameters: serde_json::json!({"recipe_id": recipe_id.to_string()}),
        created_at: chrono::Utc::now(),
        executed_at: None,
    });

    tokio::time::sleep(Duration::from_millis(10)).await;
    mock.insert_emergency_signal("terminal_2", "interlock tripped", "critical").await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(monitor.is_in_emergency_state(), "emergency flag should be set after the signal is polled");

    // Reaction (ii): Terminal 1 drives owned outputs safe.
    logger.run_cycle().await;
    {
        let writes = transport.writes.lock().unwrap();
        assert!(wrote_coil_closed(&writes, 10), "terminal 1 should have written valve 1's coil closed during emergency");
    }

    // Reaction (iii): refuse new commands until a reset row is written.
    // `poll_once` is crate-private, so drive it the same way a terminal
    // does: spin up `run`, let its first immediate poll happen, then
    // shut it down again before inspecting the store.
    {
        let (source_shutdown_tx, source_shutdown_rx) = watch::channel(false);
        let source_for_task = source.clone();
        let task = tokio::spawn(async move { source_for_task.run(source_shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = source_shutdown_tx.send(true);
        let _ = task.await;
    }
    let still_pending = store.poll_recipe_commands("m1").await.unwrap();
    assert!(
        still_pending.iter().any(|c| c.id == command_id),
        "recipe command submitted during emergency must remain unclaimed until reset"
    );

    mock.insert_emergency_reset("operator").await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!monitor.is_in_emergency_state(), "emergency flag should clear after a reset row");

    {
        let (source_shutdown_tx, source_shutdown_rx) = watch::channel(false);
        let source_for_task = source.clone();
        let task = tokio::spawn(async move { source_for_task.run(source_shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        let _ = source_shutdown_tx.send(true);
        let _ = task.await;
    }
    let still_pending_after_reset = store.poll_recipe_commands("m1").await.unwrap();
    assert!(
        !still_pending_after_reset.iter().any(|c| c.id == command_id),
        "recipe command should be claimed and run once the emergency clears"
    );

    let _ = shutdown_tx.send(true);
    let _ = handle.await;
}

/// Scenario 4: a transport that fails its first round-trip with a
/// broken-pipe-shaped error recovers on retry without the caller seeing
/// more than one failed attempt.
#[tokio::test]
async fn broken_pipe_recovers_within_the_communicators_own_retries() {
    struct FlakyTransport {
        calls: AtomicU32,
        reconnects: AtomicU32,
    }
    #[async_trait]
    impl Transport for FlakyTransport {
        async fn write(&self, _buf: &[u8]) -> PlcResult<()> {
            Ok(())
        }
        async fn read_exact(&self, buf: &mut [u8]) -> PlcResult<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                return Err(aldctl::error::PlcError::transport("broken pipe"));
            }
            let canned: [u8; 11] = [0, 0, 0, 0, 0, 5, 1, 3, 2, 0, 7];
            let len = buf.len().min(canned.len());
            buf[..len].copy_from_slice(&canned[..len]);
            Ok(())
        }
        async fn reconnect(&self) {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
        }
    }
    let transport = Arc::new(FlakyTransport { calls: AtomicU32::new(0), reconnects: AtomicU32::new(0) });
    let communicator = PlcCommunicator::new(transport.clone(), 1, ByteOrder::Badc);

    let result = communicator.read_holding_registers(0, 1).await;
    assert!(result.is_ok(), "retry should recover from the first broken-pipe failure: {result:?}");
    assert!(transport.reconnects.load(Ordering::SeqCst) >= 1, "a broken-pipe failure should trigger reconnect");
}

/// Scenario 3: dual-mode logging writes to both streams while a process
/// is active and only to history while idle.
#[tokio::test]
async fn dual_mode_logging_writes_both_streams_while_processing() {
    // A holding-register parameter, not a coil: AlwaysOkTransport's canned
    // response is shaped like a function-code-3 reply, so this exercises
    // read_holding_registers rather than read_coils/parse_bool.
    let temperature_row = ComponentParameterRow {
        id: 1,
        parameter_name: "temperature_read".to_owned(),
        component_name: "Diagnostics".to_owned(),
        read_modbus_address: Some(100),
        write_modbus_address: None,
        data_type: DataType::U16,
        min_value: None,
        max_value: None,
        is_writable: false,
        unit: None,
    };
    let mock = Arc::new(MockStore::new());
    mock.seed_parameters(vec![temperature_row.clone()]);
    let registry = Arc::new(Registry::build(vec![temperature_row], &HashMap::new(), false));
    let transport = Arc::new(AlwaysOkTransport);
    let communicator = Arc::new(PlcCommunicator::new(transport, 1, ByteOrder::Badc));
    let store: Arc<dyn Store> = mock.clone();
    let dlq = Arc::new(aldctl::store::dlq::DeadLetterQueue::new(std::env::temp_dir().join("aldctl-scenario-dlq-2")));
    let writer = Arc::new(Writer::start(store.clone(), dlq, Duration::from_secs(3600)));

    let process_id = Uuid::new_v4();
    mock.seed_machine_state(
        "m1",
        MachineState { status: MachineStatus::Processing, current_process_id: Some(process_id), last_heartbeat: chrono::Utc::now() },
    );

    let emergency = Arc::new(EmergencyMonitor::new(store.clone()));
    let logger = ContinuousLogger::new(communicator, registry, store, writer.clone(), "m1".to_owned(), emergency);
    logger.start().await;
    tokio::time::sleep(Duration::from_millis(3200)).await;
    logger.stop().await;

    assert!(mock.parameter_history().len() >= 2, "history rows: {}", mock.parameter_history().len());
    assert!(mock.process_data_points().len() >= 2, "data point rows: {}", mock.process_data_points().len());
}
