//! In-memory `Store` double (SPEC_FULL §10.5). Backs every unit and
//! integration test so the suite never needs a live Postgres instance,
//! grounded on the same trait-object seam the teacher uses for `Comm`.

use super::{
    AuditRecord, ComponentParameterRow, EmergencySignalRow, MachineState, MachineStatus,
    ParameterControlCommandRow, ParameterHistorySample, ParameterOpRow, ProcessDataPoint, Recipe,
    RecipeCommandRow, RecipeStepRow, Store, ValveOpRow,
};
use crate::error::{PlcError, PlcResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    parameters: Vec<ComponentParameterRow>,
    machine_states: HashMap<String, MachineState>,
    recipes: HashMap<Uuid, Recipe>,
    recipe_steps: HashMap<Uuid, Vec<RecipeStepRow>>,
    process_executions: HashMap<Uuid, String>,
    parameter_history: Vec<ParameterHistorySample>,
    process_data_points: Vec<ProcessDataPoint>,
    audit_records: Vec<AuditRecord>,
    recipe_commands: Vec<RecipeCommandRow>,
    parameter_control_commands: Vec<ParameterControlCommandRow>,
    emergency_signals: Vec<EmergencySignalRow>,
    emergency_resets: Vec<DateTime<Utc>>,
    plc_lease: Option<(String, DateTime<Utc>)>,
    valve_locks: HashMap<u32, (String, Uuid, DateTime<Utc>)>,
    valve_ops: Vec<ValveOpRow>,
    parameter_ops: Vec<ParameterOpRow>,
}

pub struct MockStore {
    inner: Mutex<Inner>,
}

impl Default for MockStore {
    fn default() -> Self {
        MockStore {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_parameters(&self, rows: Vec<ComponentParameterRow>) {
        self.inner.lock().parameters = rows;
    }

    pub fn seed_recipe(&self, recipe: Recipe, steps: Vec<RecipeStepRow>) {
        let mut inner = self.inner.lock();
        inner.recipe_steps.insert(recipe.id, steps);
        inner.recipes.insert(recipe.id, recipe);
    }

    pub fn seed_machine_state(&self, machine_id: &str, state: MachineState) {
        self.inner.lock().machine_states.insert(machine_id.to_owned(), state);
    }

    pub fn seed_parameter_control_command(&self, row: ParameterControlCommandRow) {
        self.inner.lock().parameter_control_commands.push(row);
    }

    pub fn seed_recipe_command(&self, row: RecipeCommandRow) {
        self.inner.lock().recipe_commands.push(row);
    }

    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.inner.lock().audit_records.clone()
    }

    pub fn parameter_history(&self) -> Vec<ParameterHistorySample> {
        self.inner.lock().parameter_history.clone()
    }

    pub fn process_data_points(&self) -> Vec<ProcessDataPoint> {
        self.inner.lock().process_data_points.clone()
    }

    pub fn parameter_control_commands(&self) -> Vec<ParameterControlCommandRow> {
        self.inner.lock().parameter_control_commands.clone()
    }

    pub fn process_executions(&self) -> Vec<(Uuid, String)> {
        self.inner.lock().process_executions.clone().into_iter().collect()
    }
}

#[async_trait]
impl Store for MockStore {
    async fn load_component_parameters(&self) -> PlcResult<Vec<ComponentParameterRow>> {
        Ok(self.inner.lock().parameters.clone())
    }

    async fn get_machine_state(&self, machine_id: &str) -> PlcResult<MachineState> {
        self.inner
            .lock()
            .machine_states
            .get(machine_id)
            .cloned()
            .ok_or_else(|| PlcError::store_unavailable(format!("no machine state for {machine_id}")))
    }

    async fn set_machine_status(&self, machine_id: &str, status: MachineStatus) -> PlcResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner
            .machine_states
            .entry(machine_id.to_owned())
            .or_insert_with(|| MachineState {
                status: MachineStatus::Idle,
                current_process_id: None,
                last_heartbeat: Utc::now(),
            });
        entry.status = status;
        Ok(())
    }

    async fn heartbeat_machine(&self, machine_id: &str) -> PlcResult<()> {
        if let Some(state) = self.inner.lock().machine_states.get_mut(machine_id) {
            state.last_heartbeat = Utc::now();
        }
        Ok(())
    }

    async fn begin_process_execution(
        &self,
        machine_id: &str,
        _recipe_id: Uuid,
        _recipe_version_snapshot: i32,
    ) -> PlcResult<Uuid> {
        let id = Uuid::new_v4();
        let mut inner = self.inner.lock();
        inner.process_executions.insert(id, "running".to_owned());
        if let Some(state) = inner.machine_states.get_mut(machine_id) {
            state.current_process_id = Some(id);
        }
        Ok(id)
    }

    async fn end_process_execution(&self, process_id: Uuid, status: &str) -> PlcResult<()> {
        self.inner
            .lock()
            .process_executions
            .insert(process_id, status.to_owned());
        Ok(())
    }

    async fn load_recipe(&self, recipe_id: Uuid) -> PlcResult<Recipe> {
        self.inner
            .lock()
            .recipes
            .get(&recipe_id)
            .cloned()
            .ok_or_else(|| PlcError::not_configured(format!("recipe {recipe_id}")))
    }

    async fn load_recipe_steps(&self, recipe_id: Uuid) -> PlcResult<Vec<RecipeStepRow>> {
        Ok(self
            .inner
            .lock()
            .recipe_steps
            .get(&recipe_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_parameter_history_batch(
        &self,
        rows: &[ParameterHistorySample],
    ) -> PlcResult<()> {
        self.inner.lock().parameter_history.extend_from_slice(rows);
        Ok(())
    }

    async fn insert_process_data_point_batch(&self, rows: &[ProcessDataPoint]) -> PlcResult<()> {
        self.inner.lock().process_data_points.extend_from_slice(rows);
        Ok(())
    }

    async fn insert_audit_record(&self, row: &AuditRecord) -> PlcResult<()> {
        self.inner.lock().audit_records.push(row.clone());
        Ok(())
    }

    async fn poll_recipe_commands(&self, machine_id: &str) -> PlcResult<Vec<RecipeCommandRow>> {
        Ok(self
            .inner
            .lock()
            .recipe_commands
            .iter()
            .filter(|c| c.executed_at.is_none() && c.machine_id.as_deref().map_or(true, |m| m == machine_id))
            .cloned()
            .collect())
    }

    async fn claim_recipe_command(&self, id: Uuid) -> PlcResult<bool> {
        let mut inner = self.inner.lock();
        if let Some(cmd) = inner.recipe_commands.iter_mut().find(|c| c.id == id) {
            if cmd.executed_at.is_none() {
                cmd.executed_at = Some(Utc::now());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn poll_parameter_control_commands(
        &self,
        machine_id: &str,
    ) -> PlcResult<Vec<ParameterControlCommandRow>> {
        Ok(self
            .inner
            .lock()
            .parameter_control_commands
            .iter()
            .filter(|c| c.executed_at.is_none() && c.machine_id.as_deref().map_or(true, |m| m == machine_id))
            .cloned()
            .collect())
    }

    async fn claim_parameter_control_command(&self, id: Uuid) -> PlcResult<bool> {
        let mut inner = self.inner.lock();
        if let Some(cmd) = inner.parameter_control_commands.iter_mut().find(|c| c.id == id) {
            if cmd.executed_at.is_none() {
                cmd.executed_at = Some(Utc::now());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn complete_parameter_control_command(
        &self,
        id: Uuid,
        error_message: Option<String>,
    ) -> PlcResult<()> {
        let mut inner = self.inner.lock();
        if let Some(cmd) = inner.parameter_control_commands.iter_mut().find(|c| c.id == id) {
            cmd.completed_at = Some(Utc::now());
            cmd.error_message = error_message;
        }
        Ok(())
    }

    async fn insert_emergency_signal(
        &self,
        source: &str,
        reason: &str,
        severity: &str,
    ) -> PlcResult<Uuid> {
        let id = Uuid::new_v4();
        self.inner.lock().emergency_signals.push(EmergencySignalRow {
            id,
            source: source.to_owned(),
            reason: reason.to_owned(),
            severity: severity.to_owned(),
            created_at: Utc::now(),
        });
        Ok(id)
    }

    async fn poll_emergency_signals_since(
        &self,
        since: DateTime<Utc>,
    ) -> PlcResult<Vec<EmergencySignalRow>> {
        Ok(self
            .inner
            .lock()
            .emergency_signals
            .iter()
            .filter(|e| e.created_at > since)
            .cloned()
            .collect())
    }

    async fn insert_emergency_reset(&self, _source: &str) -> PlcResult<()> {
        self.inner.lock().emergency_resets.push(Utc::now());
        Ok(())
    }

    async fn latest_emergency_reset_at(&self) -> PlcResult<Option<DateTime<Utc>>> {
        Ok(self.inner.lock().emergency_resets.last().copied())
    }

    async fn acquire_plc_lease(&self, holder: &str, ttl_seconds: i64) -> PlcResult<bool> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let grant = match &inner.plc_lease {
            Some((h, expires)) => h == holder || *expires < now,
            None => true,
        };
        if grant {
            inner.plc_lease = Some((holder.to_owned(), now + chrono::Duration::seconds(ttl_seconds)));
        }
        Ok(grant)
    }

    async fn renew_plc_lease(&self, holder: &str, ttl_seconds: i64) -> PlcResult<bool> {
        let mut inner = self.inner.lock();
        match &mut inner.plc_lease {
            Some((h, expires)) if h == holder => {
                *expires = Utc::now() + chrono::Duration::seconds(ttl_seconds);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn current_plc_lease_holder(&self) -> PlcResult<Option<String>> {
        let inner = self.inner.lock();
        Ok(inner.plc_lease.as_ref().filter(|(_, e)| *e > Utc::now()).map(|(h, _)| h.clone()))
    }

    async fn acquire_valve_lock(
        &self,
        valve_number: u32,
        holder: &str,
        operation_id: Uuid,
        ttl_seconds: i64,
    ) -> PlcResult<bool> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        let occupied = inner
            .valve_locks
            .get(&valve_number)
            .is_some_and(|(_, _, expires)| *expires > now);
        if occupied {
            return Ok(false);
        }
        inner.valve_locks.insert(
            valve_number,
            (holder.to_owned(), operation_id, now + chrono::Duration::seconds(ttl_seconds)),
        );
        Ok(true)
    }

    async fn release_valve_lock(&self, valve_number: u32, operation_id: Uuid) -> PlcResult<()> {
        let mut inner = self.inner.lock();
        if let Some((_, op, _)) = inner.valve_locks.get(&valve_number) {
            if *op == operation_id {
                inner.valve_locks.remove(&valve_number);
            }
        }
        Ok(())
    }

    async fn submit_valve_op(&self, row: ValveOpRow) -> PlcResult<()> {
        self.inner.lock().valve_ops.push(row);
        Ok(())
    }

    async fn poll_pending_valve_ops(&self) -> PlcResult<Vec<ValveOpRow>> {
        Ok(self
            .inner
            .lock()
            .valve_ops
            .iter()
            .filter(|op| op.claimed_at.is_none())
            .cloned()
            .collect())
    }

    async fn claim_valve_op(&self, id: Uuid) -> PlcResult<bool> {
        let mut inner = self.inner.lock();
        if let Some(op) = inner.valve_ops.iter_mut().find(|op| op.id == id) {
            if op.claimed_at.is_none() {
                op.claimed_at = Some(Utc::now());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn complete_valve_op(&self, id: Uuid, error_message: Option<String>) -> PlcResult<()> {
        let mut inner = self.inner.lock();
        if let Some(op) = inner.valve_ops.iter_mut().find(|op| op.id == id) {
            op.completed_at = Some(Utc::now());
            op.error_message = error_message;
        }
        Ok(())
    }

    async fn get_valve_op(&self, id: Uuid) -> PlcResult<Option<ValveOpRow>> {
        Ok(self.inner.lock().valve_ops.iter().find(|op| op.id == id).cloned())
    }

    async fn submit_parameter_op(&self, row: ParameterOpRow) -> PlcResult<()> {
        self.inner.lock().parameter_ops.push(row);
        Ok(())
    }

    async fn poll_pending_parameter_ops(&self) -> PlcResult<Vec<ParameterOpRow>> {
        Ok(self
            .inner
            .lock()
            .parameter_ops
            .iter()
            .filter(|op| op.claimed_at.is_none())
            .cloned()
            .collect())
    }

    async fn claim_parameter_op(&self, id: Uuid) -> PlcResult<bool> {
        let mut inner = self.inner.lock();
        if let Some(op) = inner.parameter_ops.iter_mut().find(|op| op.id == id) {
            if op.claimed_at.is_none() {
                op.claimed_at = Some(Utc::now());
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn complete_parameter_op(
        &self,
        id: Uuid,
        result_value: Option<f64>,
        error_message: Option<String>,
    ) -> PlcResult<()> {
        let mut inner = self.inner.lock();
        if let Some(op) = inner.parameter_ops.iter_mut().find(|op| op.id == id) {
            op.completed_at = Some(Utc::now());
            op.result_value = result_value;
            op.error_message = error_message;
        }
        Ok(())
    }

    async fn get_parameter_op(&self, id: Uuid) -> PlcResult<Option<ParameterOpRow>> {
        Ok(self.inner.lock().parameter_ops.iter().find(|op| op.id == id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn valve_lock_is_exclusive_until_expiry_or_release() {
        let store = MockStore::new();
        let op1 = Uuid::new_v4();
        let op2 = Uuid::new_v4();
        assert!(store.acquire_valve_lock(1, "terminal_2", op1, 10).await.unwrap());
        assert!(!store.acquire_valve_lock(1, "terminal_3", op2, 10).await.unwrap());
        store.release_valve_lock(1, op1).await.unwrap();
        assert!(store.acquire_valve_lock(1, "terminal_3", op2, 10).await.unwrap());
    }

    #[tokio::test]
    async fn parameter_control_command_claim_is_single_use() {
        let store = MockStore::new();
        let id = Uuid::new_v4();
        store.seed_parameter_control_command(ParameterControlCommandRow {
            id,
            machine_id: None,
            parameter_name: Some("Temperature".into()),
            component_parameter_id: None,
            target_value: 100.0,
            executed_at: None,
            completed_at: None,
            error_message: None,
        });
        assert!(store.claim_parameter_control_command(id).await.unwrap());
        assert!(!store.claim_parameter_control_command(id).await.unwrap());
    }
}
