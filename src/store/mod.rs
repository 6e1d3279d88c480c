//! The cloud-hosted relational store (spec §6 External Interfaces).
//!
//! `Store` is the one trait every component depends on; `postgres`
//! backs it with `sqlx`, `mock` backs it with an in-memory double for
//! tests. Grounded on the `ProcessStore` trait + `PostgresProcessStore`
//! pattern used throughout the example pack's sqlx-backed services.

pub mod dlq;
pub mod mock;
pub mod postgres;
pub mod writer;

use crate::codec::DataType;
use crate::error::PlcResult;
use serde::{Deserialize, Serialize};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use mock::MockStore;
pub use postgres::PostgresStore;

#[derive(Debug, Clone)]
pub struct ComponentParameterRow {
    pub id: i64,
    pub parameter_name: String,
    pub component_name: String,
    pub read_modbus_address: Option<u16>,
    pub write_modbus_address: Option<u16>,
    pub data_type: DataType,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub is_writable: bool,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineStatus {
    Idle,
    Processing,
    Emergency,
}

#[derive(Debug, Clone)]
pub struct MachineState {
    pub status: MachineStatus,
    pub current_process_id: Option<Uuid>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterHistorySample {
    pub parameter_id: i64,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub machine_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDataPoint {
    pub process_id: Uuid,
    pub parameter_id: i64,
    pub value: f64,
    pub set_point: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub machine_id: String,
    pub parameter_name: Option<String>,
    pub component_parameter_id: Option<i64>,
    pub target_value: f64,
    pub executed_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandTableKind {
    Recipe,
    ParameterControl,
}

#[derive(Debug, Clone)]
pub struct RecipeCommandRow {
    pub id: Uuid,
    pub command_type: String,
    pub machine_id: Option<String>,
    pub parameters: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ParameterControlCommandRow {
    pub id: Uuid,
    pub machine_id: Option<String>,
    pub parameter_name: Option<String>,
    pub component_parameter_id: Option<i64>,
    pub target_value: f64,
    pub executed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EmergencySignalRow {
    pub id: Uuid,
    pub source: String,
    pub reason: String,
    pub severity: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Recipe {
    pub id: Uuid,
    pub name: String,
    pub version: i32,
}

#[derive(Debug, Clone)]
pub struct RecipeStepRow {
    pub id: Uuid,
    pub recipe_id: Uuid,
    pub sequence_number: i32,
    pub parent_step_id: Option<Uuid>,
    pub step_type: String,
    pub parameters: serde_json::Value,
}

/// A Terminal 2/3-submitted coil write, serviced by Terminal 1's PLC
/// operation drain (spec §4.I PLC exclusivity: Terminals 2 and 3 never
/// open a Modbus socket, so a valve write becomes a row here instead of
/// a direct `write_coil` call).
#[derive(Debug, Clone)]
pub struct ValveOpRow {
    pub id: Uuid,
    pub coil_address: u16,
    pub value: bool,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterOpKind {
    Read,
    Write,
}

/// A Terminal 2/3-submitted register read or write, serviced by Terminal
/// 1's PLC operation drain. `write_value`/`result_value` travel as `f64`
/// since that is the one shape every `DataType` round-trips through
/// (`RawValue::as_f64` / `RawValue::from_f64`).
#[derive(Debug, Clone)]
pub struct ParameterOpRow {
    pub id: Uuid,
    pub address: u16,
    pub data_type: DataType,
    pub kind: ParameterOpKind,
    pub write_value: Option<f64>,
    pub requested_by: String,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result_value: Option<f64>,
    pub error_message: Option<String>,
}

/// One method per table/operation named in spec §6. Every component in
/// §4 depends on this; it is ambient infrastructure the spec's Non-goals
/// do not exclude.
#[async_trait]
pub trait Store: Send + Sync {
    async fn load_component_parameters(&self) -> PlcResult<Vec<ComponentParameterRow>>;

    async fn get_machine_state(&self, machine_id: &str) -> PlcResult<MachineState>;
    async fn set_machine_status(&self, machine_id: &str, status: MachineStatus) -> PlcResult<()>;
    async fn heartbeat_machine(&self, machine_id: &str) -> PlcResult<()>;

    async fn begin_process_execution(
        &self,
        machine_id: &str,
        recipe_id: Uuid,
        recipe_version_snapshot: i32,
    ) -> PlcResult<Uuid>;
    async fn end_process_execution(&self, process_id: Uuid, status: &str) -> PlcResult<()>;

    async fn load_recipe(&self, recipe_id: Uuid) -> PlcResult<Recipe>;
    async fn load_recipe_steps(&self, recipe_id: Uuid) -> PlcResult<Vec<RecipeStepRow>>;

    async fn insert_parameter_history_batch(
        &self,
        rows: &[ParameterHistorySample],
    ) -> PlcResult<()>;
    async fn insert_process_data_point_batch(&self, rows: &[ProcessDataPoint]) -> PlcResult<()>;
    async fn insert_audit_record(&self, row: &AuditRecord) -> PlcResult<()>;

    async fn poll_recipe_commands(&self, machine_id: &str) -> PlcResult<Vec<RecipeCommandRow>>;
    async fn claim_recipe_command(&self, id: Uuid) -> PlcResult<bool>;

    async fn poll_parameter_control_commands(
        &self,
        machine_id: &str,
    ) -> PlcResult<Vec<ParameterControlCommandRow>>;
    async fn claim_parameter_control_command(&self, id: Uuid) -> PlcResult<bool>;
    async fn complete_parameter_control_command(
        &self,
        id: Uuid,
        error_message: Option<String>,
    ) -> PlcResult<()>;

    async fn insert_emergency_signal(
        &self,
        source: &str,
        reason: &str,
        severity: &str,
    ) -> PlcResult<Uuid>;
    async fn poll_emergency_signals_since(
        &self,
        since: DateTime<Utc>,
    ) -> PlcResult<Vec<EmergencySignalRow>>;
    async fn insert_emergency_reset(&self, source: &str) -> PlcResult<()>;
    async fn latest_emergency_reset_at(&self) -> PlcResult<Option<DateTime<Utc>>>;

    async fn acquire_plc_lease(&self, holder: &str, ttl_seconds: i64) -> PlcResult<bool>;
    async fn renew_plc_lease(&self, holder: &str, ttl_seconds: i64) -> PlcResult<bool>;
    async fn current_plc_lease_holder(&self) -> PlcResult<Option<String>>;

    async fn acquire_valve_lock(
        &self,
        valve_number: u32,
        holder: &str,
        operation_id: Uuid,
        ttl_seconds: i64,
    ) -> PlcResult<bool>;
    async fn release_valve_lock(&self, valve_number: u32, operation_id: Uuid) -> PlcResult<()>;

    /// Queues a coil write for Terminal 1's drain to service (§4.I).
    async fn submit_valve_op(&self, row: ValveOpRow) -> PlcResult<()>;
    async fn poll_pending_valve_ops(&self) -> PlcResult<Vec<ValveOpRow>>;
    async fn claim_valve_op(&self, id: Uuid) -> PlcResult<bool>;
    async fn complete_valve_op(&self, id: Uuid, error_message: Option<String>) -> PlcResult<()>;
    async fn get_valve_op(&self, id: Uuid) -> PlcResult<Option<ValveOpRow>>;

    /// Queues a register read or write for Terminal 1's drain to service.
    async fn submit_parameter_op(&self, row: ParameterOpRow) -> PlcResult<()>;
    async fn poll_pending_parameter_ops(&self) -> PlcResult<Vec<ParameterOpRow>>;
    async fn claim_parameter_op(&self, id: Uuid) -> PlcResult<bool>;
    async fn complete_parameter_op(
        &self,
        id: Uuid,
        result_value: Option<f64>,
        error_message: Option<String>,
    ) -> PlcResult<()>;
    async fn get_parameter_op(&self, id: Uuid) -> PlcResult<Option<ParameterOpRow>>;
}
