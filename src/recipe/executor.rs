//! Recipe Executor (spec §4.F): walks a recipe's step tree against the
//! PLC, emitting one audit row per observable effect and tolerating
//! cancellation between steps, within a purge sleep, and between a
//! loop's iterations.

use super::{
    build_step_tree, parse_params, LoopStepParams, PurgeStepParams, SetParameterStepParams,
    StepNode, ValveState, ValveStepParams,
};
use crate::codec::RawValue;
use crate::coordination::EmergencyMonitor;
use crate::error::{PlcError, PlcResult};
use crate::plc::PlcClient;
use crate::registry::{Parameter, Registry};
use crate::store::writer::Writer;
use crate::store::{AuditRecord, RecipeStepRow, Store};
use chrono::Utc;
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

const READ_BACK_DELAY: Duration = Duration::from_millis(200);
const VALVE_LOCK_MARGIN_SECS: i64 = 2;

pub struct RecipeExecutor {
    plc: Arc<dyn PlcClient>,
    registry: Arc<Registry>,
    store: Arc<dyn Store>,
    writer: Arc<Writer>,
    machine_id: String,
    emergency: Arc<EmergencyMonitor>,
    /// Valves this execution has opened and not yet explicitly closed,
    /// tracked so a cancellation can drive them back to a safe state
    /// (spec §4.F: "any in-flight valve left open SHOULD be closed").
    open_valves: Mutex<HashMap<u32, u16>>,
}

impl RecipeExecutor {
    pub fn new(
        plc: Arc<dyn PlcClient>,
        registry: Arc<Registry>,
        store: Arc<dyn Store>,
        writer: Arc<Writer>,
        machine_id: String,
        emergency: Arc<EmergencyMonitor>,
    ) -> Self {
        RecipeExecutor {
            plc,
            registry,
            store,
            writer,
            machine_id,
            emergency,
            open_valves: Mutex::new(HashMap::new()),
        }
    }

    /// Runs one process execution to completion, cancellation, or
    /// failure, and always records the terminal status on
    /// `process_executions`.
    pub async fn execute(
        &self,
        process_execution_id: Uuid,
        recipe_id: Uuid,
        mut cancel: watch::Receiver<bool>,
    ) -> PlcResult<()> {
        let steps = self.store.load_recipe_steps(recipe_id).await?;
        let tree = build_step_tree(steps);

        let mut cancelled = *cancel.borrow() || self.emergency.is_in_emergency_state();
        let mut failure = None;

        for node in &tree {
            if cancelled {
                break;
            }
            let result = if node.row.step_type == "loop" {
                self.execute_loop(node, &mut cancel).await
            } else {
                self.execute_leaf(&node.row, &mut cancel).await
            };
            match result {
                Ok(()) => {}
                Err(PlcError::Cancelled) => {
                    cancelled = true;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
            if self.emergency.is_in_emergency_state() {
                cancelled = true;
            }
        }

        if cancelled {
            self.close_open_valves().await;
        }

        let status = if failure.is_some() {
            "failed"
        } else if cancelled {
            "aborted"
        } else {
            "completed"
        };
        self.store.end_process_execution(process_execution_id, status).await?;

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn close_open_valves(&self) {
        let open: Vec<(u32, u16)> = {
            let mut map = self.open_valves.lock().await;
            map.drain().collect()
        };
        for (valve_number, coil_address) in open {
            if let Err(e) = self.plc.write_coil(coil_address, false).await {
                warn!("failed to close valve {valve_number} during cancellation cleanup: {e}");
            }
        }
    }

    async fn execute_loop(&self, node: &StepNode, cancel: &mut watch::Receiver<bool>) -> PlcResult<()> {
        let params: LoopStepParams = parse_params(&node.row)?;
        for _ in 0..params.count {
            if *cancel.borrow() || self.emergency.is_in_emergency_state() {
                return Err(PlcError::Cancelled);
            }
            for child in &node.children {
                if *cancel.borrow() || self.emergency.is_in_emergency_state() {
                    return Err(PlcError::Cancelled);
                }
                self.execute_leaf(child, cancel).await?;
            }
        }
        Ok(())
    }

    async fn execute_leaf(&self, row: &RecipeStepRow, cancel: &mut watch::Receiver<bool>) -> PlcResult<()> {
        match row.step_type.as_str() {
            "valve" => self.execute_valve(row).await,
            "purge" => self.execute_purge(row, cancel).await,
            "set_parameter" => self.execute_set_parameter(row).await,
            other => Err(PlcError::fatal(format!("unknown step type: {other}"))),
        }
    }

    async fn execute_valve(&self, row: &RecipeStepRow) -> PlcResult<()> {
        let params: ValveStepParams = parse_params(row)?;
        let valve = match (params.valve_number, params.valve_param_id) {
            (Some(n), _) => self.registry.valve(n)?,
            (None, Some(pid)) => self.registry.valve_by_parameter_id(pid)?,
            (None, None) => {
                return Err(PlcError::not_configured("valve step missing valve_number/valve_param_id"))
            }
        };
        let valve_number = valve.number;
        let coil_address = valve.coil_address;
        let parameter_id = valve.parameter_id;
        let parameter_name = self.registry.parameter(parameter_id).ok().map(|p| p.name.clone());

        let operation_id = Uuid::new_v4();
        let lock_ttl = params
            .duration_ms
            .map(|ms| (ms as i64) / 1000 + VALVE_LOCK_MARGIN_SECS)
            .unwrap_or(VALVE_LOCK_MARGIN_SECS)
            .max(1);
        let holder = format!("recipe_executor:{}", self.machine_id);
        if !self
            .store
            .acquire_valve_lock(valve_number, &holder, operation_id, lock_ttl)
            .await?
        {
            return Err(PlcError::transport(format!("valve {valve_number} is locked by another operation")));
        }

        let open = matches!(params.state, ValveState::Open | ValveState::Pulse);
        let target_value = if open { 1.0 } else { 0.0 };

        let executed_at = Utc::now();
        let write_result = self.plc.write_coil(coil_address, open).await;
        let completed_at = Utc::now();
        let error_message = write_result.as_ref().err().map(|e| e.to_string());

        self.writer.submit_audit(AuditRecord {
            id: Uuid::new_v4(),
            machine_id: self.machine_id.clone(),
            parameter_name,
            component_parameter_id: Some(parameter_id),
            target_value,
            executed_at,
            completed_at: Some(completed_at),
            error_message,
        });

        if write_result.is_err() {
            self.store.release_valve_lock(valve_number, operation_id).await?;
            return write_result;
        }

        if open {
            self.open_valves.lock().await.insert(valve_number, coil_address);
        } else {
            self.open_valves.lock().await.remove(&valve_number);
        }

        match (open, params.duration_ms.filter(|ms| *ms > 0)) {
            (true, Some(ms)) => {
                let plc = self.plc.clone();
                let store = self.store.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    if let Err(e) = plc.write_coil(coil_address, false).await {
                        warn!("scheduled close of valve {valve_number} failed: {e}");
                    }
                    let _ = store.release_valve_lock(valve_number, operation_id).await;
                });
            }
            _ => {
                self.store.release_valve_lock(valve_number, operation_id).await?;
            }
        }

        Ok(())
    }

    /// Purge is implemented as a single audit row spanning the whole
    /// open-sleep-close sequence, rather than separate begin/end rows
    /// (spec §4.F leaves this choice to the implementation).
    async fn execute_purge(&self, row: &RecipeStepRow, cancel: &mut watch::Receiver<bool>) -> PlcResult<()> {
        let params: PurgeStepParams = parse_params(row)?;
        let purge = self.registry.purge_trigger()?;
        let address = purge
            .write_address
            .ok_or_else(|| PlcError::not_configured("purge trigger has no write address"))?;
        let parameter_name = Some(purge.name.clone());
        let parameter_id = purge.id;

        let executed_at = Utc::now();
        self.plc.write_coil(address, true).await?;

        let mut cancelled = false;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(params.duration_ms);
        const POLL: Duration = Duration::from_millis(50);
        loop {
            if *cancel.borrow() || self.emergency.is_in_emergency_state() {
                cancelled = true;
                break;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                break;
            }
            let remaining = deadline - now;
            tokio::select! {
                _ = tokio::time::sleep(remaining.min(POLL)) => {}
                _ = cancel.changed() => {}
            }
        }

        let off_result = self.plc.write_coil(address, false).await;
        let completed_at = Utc::now();
        let error_message = off_result
            .as_ref()
            .err()
            .map(|e| e.to_string())
            .or_else(|| cancelled.then(|| "cancelled".to_owned()));

        self.writer.submit_audit(AuditRecord {
            id: Uuid::new_v4(),
            machine_id: self.machine_id.clone(),
            parameter_name,
            component_parameter_id: Some(parameter_id),
            target_value: 0.0,
            executed_at,
            completed_at: Some(completed_at),
            error_message,
        });

        off_result?;
        let _ = params.gas_type;
        if cancelled {
            return Err(PlcError::Cancelled);
        }
        Ok(())
    }

    async fn execute_set_parameter(&self, row: &RecipeStepRow) -> PlcResult<()> {
        let params: SetParameterStepParams = parse_params(row)?;
        let parameter: &Parameter = match (params.component_parameter_id, &params.parameter_name) {
            (Some(id), _) => self.registry.parameter(id)?,
            (None, Some(name)) => self.registry.parameter_by_name(name)?,
            (None, None) => return Err(PlcError::not_configured("set_parameter step missing target")),
        };

        if let (Some(min), Some(max)) = (parameter.min_value, parameter.max_value) {
            if params.value < min || params.value > max {
                return Err(PlcError::OutOfRange {
                    parameter: parameter.name.clone(),
                    value: params.value,
                    min,
                    max,
                });
            }
        }

        let write_address = parameter
            .write_address
            .ok_or_else(|| PlcError::not_configured(format!("parameter {} has no write address", parameter.name)))?;
        let raw_write = match parameter.scaling {
            Some(scaling) => scaling.to_raw_voltage(params.value),
            None => params.value,
        };

        let executed_at = Utc::now();
        let write_result = self
            .plc
            .write_value(write_address, encode_for(parameter.data_type, raw_write))
            .await;
        if let Err(e) = write_result {
            self.writer.submit_audit(AuditRecord {
                id: Uuid::new_v4(),
                machine_id: self.machine_id.clone(),
                parameter_name: Some(parameter.name.clone()),
                component_parameter_id: Some(parameter.id),
                target_value: params.value,
                executed_at,
                completed_at: Some(Utc::now()),
                error_message: Some(e.to_string()),
            });
            return Err(e);
        }

        tokio::time::sleep(READ_BACK_DELAY).await;
        let read_address = parameter.read_address.unwrap_or(write_address);
        let read_raw = self.plc.read_value(read_address, parameter.data_type).await?;
        let read_eu = match parameter.scaling {
            Some(scaling) => scaling.to_engineering_units(read_raw.as_f64()),
            None => read_raw.as_f64(),
        };
        let tolerance = verify_tolerance(parameter.min_value, parameter.max_value);
        let mismatch = (read_eu - params.value).abs() > tolerance;
        let completed_at = Utc::now();

        self.writer.submit_audit(AuditRecord {
            id: Uuid::new_v4(),
            machine_id: self.machine_id.clone(),
            parameter_name: Some(parameter.name.clone()),
            component_parameter_id: Some(parameter.id),
            target_value: params.value,
            executed_at,
            completed_at: Some(completed_at),
            error_message: mismatch.then(|| format!("verify failed: wrote {}, read back {read_eu}", params.value)),
        });

        if mismatch {
            return Err(PlcError::VerifyFailed {
                parameter: parameter.name.clone(),
                written: params.value,
                read_back: read_eu,
                tolerance,
            });
        }
        Ok(())
    }
}

fn verify_tolerance(min: Option<f64>, max: Option<f64>) -> f64 {
    match (min, max) {
        (Some(min), Some(max)) => ((max - min) * 0.01).max(0.01),
        _ => 0.01,
    }
}

fn encode_for(ty: crate::codec::DataType, value: f64) -> RawValue {
    use crate::codec::DataType;
    match ty {
        DataType::U16 => RawValue::U16(value.round().clamp(0.0, u16::MAX as f64) as u16),
        DataType::I16 => RawValue::I16(value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16),
        DataType::U32 => RawValue::U32(value.round().clamp(0.0, u32::MAX as f64) as u32),
        DataType::I32 => RawValue::I32(value.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32),
        DataType::F32 => RawValue::F32(value as f32),
        DataType::Bool => RawValue::Bool(value != 0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::DataType;
    use crate::config::ByteOrder;
    use crate::plc::transport::Transport;
    use crate::plc::PlcCommunicator;
    use crate::store::dlq::DeadLetterQueue;
    use crate::store::{ComponentParameterRow, MockStore, Recipe, RecipeStepRow};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU16, Ordering};

    struct EchoTransport {
        last_written_register: AtomicU16,
    }

    #[async_trait]
    impl Transport for EchoTransport {
        async fn write(&self, buf: &[u8]) -> PlcResult<()> {
            // function code 6 (write single register): value is the last two bytes.
            if buf.len() >= 2 {
                let value = u16::from_be_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]);
                self.last_written_register.store(value, Ordering::SeqCst);
            }
            Ok(())
        }
        async fn read_exact(&self, buf: &mut [u8]) -> PlcResult<()> {
            let value = self.last_written_register.load(Ordering::SeqCst);
            let [hi, lo] = value.to_be_bytes();
            // Works for both the write-ack ADU and a one-register read ADU.
            let canned: [u8; 11] = [0, 0, 0, 0, 0, 5, 1, 3, 2, hi, lo];
            let n = buf.len().min(canned.len());
            buf[..n].copy_from_slice(&canned[..n]);
            Ok(())
        }
        async fn reconnect(&self) {}
    }

    fn param_row(id: i64, name: &str, component: &str, write: u16, read: u16, min: f64, max: f64) -> ComponentParameterRow {
        ComponentParameterRow {
            id,
            parameter_name: name.to_owned(),
            component_name: component.to_owned(),
            read_modbus_address: Some(read),
            write_modbus_address: Some(write),
            data_type: DataType::U16,
            min_value: Some(min),
            max_value: Some(max),
            is_writable: true,
            unit: None,
        }
    }

    fn build_executor() -> (Arc<MockStore>, RecipeExecutor) {
        let mock = Arc::new(MockStore::new());
        let registry = Arc::new(Registry::build(
            vec![param_row(1, "set_point", "Controller", 10, 10, 0.0, 100.0)],
            &HashMap::new(),
            false,
        ));
        let transport = Arc::new(EchoTransport {
            last_written_register: AtomicU16::new(0),
        });
        let communicator: Arc<dyn PlcClient> =
            Arc::new(PlcCommunicator::new(transport, 1, ByteOrder::Badc));
        let store: Arc<dyn Store> = mock.clone();
        let dlq = Arc::new(DeadLetterQueue::new(std::env::temp_dir().join(format!(
            "aldctl-executor-test-{}",
            std::process::id()
        ))));
        let writer = Arc::new(Writer::start(store.clone(), dlq, Duration::from_secs(60)));
        let emergency = Arc::new(EmergencyMonitor::new(store.clone()));
        let executor = RecipeExecutor::new(communicator, registry, store, writer, "m1".to_owned(), emergency);
        (mock, executor)
    }

    #[tokio::test]
    async fn set_parameter_step_writes_and_verifies_read_back() {
        let (mock, executor) = build_executor();
        let recipe_id = Uuid::new_v4();
        let step_id = Uuid::new_v4();
        mock.seed_recipe(
            Recipe {
                id: recipe_id,
                name: "r".into(),
                version: 1,
            },
            vec![RecipeStepRow {
                id: step_id,
                recipe_id,
                sequence_number: 0,
                parent_step_id: None,
                step_type: "set_parameter".into(),
                parameters: serde_json::json!({"parameter_name": "set_point", "value": 42.0}),
            }],
        );

        let (_tx, rx) = watch::channel(false);
        let process_id = Uuid::new_v4();
        let result = executor.execute(process_id, recipe_id, rx).await;
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(mock.audit_records().len(), 1);
    }

    #[tokio::test]
    async fn set_parameter_step_rejects_out_of_range_value() {
        let (mock, executor) = build_executor();
        let recipe_id = Uuid::new_v4();
        mock.seed_recipe(
            Recipe {
                id: recipe_id,
                name: "r".into(),
                version: 1,
            },
            vec![RecipeStepRow {
                id: Uuid::new_v4(),
                recipe_id,
                sequence_number: 0,
                parent_step_id: None,
                step_type: "set_parameter".into(),
                parameters: serde_json::json!({"parameter_name": "set_point", "value": 9001.0}),
            }],
        );

        let (_tx, rx) = watch::channel(false);
        let result = executor.execute(Uuid::new_v4(), recipe_id, rx).await;
        assert!(matches!(result, Err(PlcError::OutOfRange { .. })));
    }

    #[tokio::test]
    async fn loop_step_executes_children_count_times() {
        let (mock, executor) = build_executor();
        let recipe_id = Uuid::new_v4();
        let loop_id = Uuid::new_v4();
        mock.seed_recipe(
            Recipe {
                id: recipe_id,
                name: "r".into(),
                version: 1,
            },
            vec![
                RecipeStepRow {
                    id: loop_id,
                    recipe_id,
                    sequence_number: 0,
                    parent_step_id: None,
                    step_type: "loop".into(),
                    parameters: serde_json::json!({"count": 3}),
                },
                RecipeStepRow {
                    id: Uuid::new_v4(),
                    recipe_id,
                    sequence_number: 1,
                    parent_step_id: Some(loop_id),
                    step_type: "set_parameter".into(),
                    parameters: serde_json::json!({"parameter_name": "set_point", "value": 10.0}),
                },
            ],
        );

        let (_tx, rx) = watch::channel(false);
        let result = executor.execute(Uuid::new_v4(), recipe_id, rx).await;
        assert!(result.is_ok(), "{result:?}");
        assert_eq!(mock.audit_records().len(), 3);
    }

    #[tokio::test]
    async fn zero_count_loop_is_a_legal_no_op() {
        let (mock, executor) = build_executor();
        let recipe_id = Uuid::new_v4();
        let loop_id = Uuid::new_v4();
        mock.seed_recipe(
            Recipe {
                id: recipe_id,
                name: "r".into(),
                version: 1,
            },
            vec![
                RecipeStepRow {
                    id: loop_id,
                    recipe_id,
                    sequence_number: 0,
                    parent_step_id: None,
                    step_type: "loop".into(),
                    parameters: serde_json::json!({"count": 0}),
                },
                RecipeStepRow {
                    id: Uuid::new_v4(),
                    recipe_id,
                    sequence_number: 1,
                    parent_step_id: Some(loop_id),
                    step_type: "set_parameter".into(),
                    parameters: serde_json::json!({"parameter_name": "set_point", "value": 10.0}),
                },
            ],
        );

        let (_tx, rx) = watch::channel(false);
        let result = executor.execute(Uuid::new_v4(), recipe_id, rx).await;
        assert!(result.is_ok());
        assert_eq!(mock.audit_records().len(), 0);
    }
}
