//! `sqlx`-backed `Store` implementation (SPEC_FULL §10.5).
//!
//! Grounded on `PostgresProcessStore` (ob-poc's `bpmn-lite-core`):
//! a thin wrapper around a `PgPool`, one `sqlx::query`/`query_as` per
//! trait method, `ON CONFLICT` upserts where a row may already exist.

use super::{
    AuditRecord, ComponentParameterRow, EmergencySignalRow, MachineState, MachineStatus,
    ParameterControlCommandRow, ParameterHistorySample, ParameterOpKind, ParameterOpRow,
    ProcessDataPoint, Recipe, RecipeCommandRow, RecipeStepRow, Store, ValveOpRow,
};
use crate::codec::DataType;
use crate::error::{PlcError, PlcResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str) -> PlcResult<Self> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| PlcError::store_unavailable(format!("connect: {e}")))?;
        Ok(PostgresStore { pool })
    }
}

fn map_sqlx(e: sqlx::Error) -> PlcError {
    PlcError::store_unavailable(e.to_string())
}

fn data_type_from_str(s: &str) -> DataType {
    match s {
        "int16" => DataType::I16,
        "int32" => DataType::I32,
        "binary" => DataType::Bool,
        _ => DataType::F32,
    }
}

fn data_type_to_str(ty: DataType) -> &'static str {
    match ty {
        DataType::U16 => "uint16",
        DataType::I16 => "int16",
        DataType::U32 => "uint32",
        DataType::I32 => "int32",
        DataType::F32 => "float32",
        DataType::Bool => "binary",
    }
}

fn parameter_op_kind_from_str(s: &str) -> ParameterOpKind {
    match s {
        "write" => ParameterOpKind::Write,
        _ => ParameterOpKind::Read,
    }
}

fn parameter_op_kind_to_str(kind: ParameterOpKind) -> &'static str {
    match kind {
        ParameterOpKind::Read => "read",
        ParameterOpKind::Write => "write",
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn load_component_parameters(&self) -> PlcResult<Vec<ComponentParameterRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, parameter_name, component_name, read_modbus_address,
                   write_modbus_address, data_type, min_value, max_value,
                   is_writable, unit
            FROM component_parameters_full
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| ComponentParameterRow {
                id: row.get("id"),
                parameter_name: row.get("parameter_name"),
                component_name: row.get("component_name"),
                read_modbus_address: row.get::<Option<i32>, _>("read_modbus_address").map(|v| v as u16),
                write_modbus_address: row.get::<Option<i32>, _>("write_modbus_address").map(|v| v as u16),
                data_type: data_type_from_str(row.get("data_type")),
                min_value: row.get("min_value"),
                max_value: row.get("max_value"),
                is_writable: row.get("is_writable"),
                unit: row.get("unit"),
            })
            .collect())
    }

    async fn get_machine_state(&self, machine_id: &str) -> PlcResult<MachineState> {
        let row = sqlx::query(
            "SELECT status, current_process_id, last_heartbeat FROM machines WHERE id = $1",
        )
        .bind(machine_id)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx)?;

        let status = match row.get::<String, _>("status").as_str() {
            "processing" => MachineStatus::Processing,
            "emergency" => MachineStatus::Emergency,
            _ => MachineStatus::Idle,
        };

        Ok(MachineState {
            status,
            current_process_id: row.get("current_process_id"),
            last_heartbeat: row.get("last_heartbeat"),
        })
    }

    async fn set_machine_status(&self, machine_id: &str, status: MachineStatus) -> PlcResult<()> {
        let status_str = match status {
            MachineStatus::Idle => "idle",
            MachineStatus::Processing => "processing",
            MachineStatus::Emergency => "emergency",
        };
        sqlx::query("UPDATE machines SET status = $1 WHERE id = $2")
            .bind(status_str)
            .bind(machine_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn heartbeat_machine(&self, machine_id: &str) -> PlcResult<()> {
        sqlx::query("UPDATE machines SET last_heartbeat = now() WHERE id = $1")
            .bind(machine_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn begin_process_execution(
        &self,
        machine_id: &str,
        recipe_id: Uuid,
        recipe_version_snapshot: i32,
    ) -> PlcResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO process_executions
                (id, machine_id, recipe_id, recipe_version_snapshot, start_time, status)
            VALUES ($1, $2, $3, $4, now(), 'running')
            "#,
        )
        .bind(id)
        .bind(machine_id)
        .bind(recipe_id)
        .bind(recipe_version_snapshot)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        sqlx::query("UPDATE machines SET current_process_id = $1 WHERE id = $2")
            .bind(id)
            .bind(machine_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(id)
    }

    async fn end_process_execution(&self, process_id: Uuid, status: &str) -> PlcResult<()> {
        sqlx::query(
            "UPDATE process_executions SET end_time = now(), status = $1 WHERE id = $2",
        )
        .bind(status)
        .bind(process_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn load_recipe(&self, recipe_id: Uuid) -> PlcResult<Recipe> {
        let row = sqlx::query("SELECT id, name, version FROM recipes WHERE id = $1")
            .bind(recipe_id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(Recipe {
            id: row.get("id"),
            name: row.get("name"),
            version: row.get("version"),
        })
    }

    async fn load_recipe_steps(&self, recipe_id: Uuid) -> PlcResult<Vec<RecipeStepRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, recipe_id, sequence_number, parent_step_id, type, parameters
            FROM recipe_steps
            WHERE recipe_id = $1
            ORDER BY sequence_number ASC
            "#,
        )
        .bind(recipe_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| RecipeStepRow {
                id: row.get("id"),
                recipe_id: row.get("recipe_id"),
                sequence_number: row.get("sequence_number"),
                parent_step_id: row.get("parent_step_id"),
                step_type: row.get("type"),
                parameters: row.get("parameters"),
            })
            .collect())
    }

    async fn insert_parameter_history_batch(
        &self,
        rows: &[ParameterHistorySample],
    ) -> PlcResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO parameter_value_history (parameter_id, value, timestamp, machine_id)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(row.parameter_id)
            .bind(row.value)
            .bind(row.timestamp)
            .bind(&row.machine_id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn insert_process_data_point_batch(&self, rows: &[ProcessDataPoint]) -> PlcResult<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO process_data_points
                    (process_id, parameter_id, value, set_point, timestamp)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(row.process_id)
            .bind(row.parameter_id)
            .bind(row.value)
            .bind(row.set_point)
            .bind(row.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn insert_audit_record(&self, row: &AuditRecord) -> PlcResult<()> {
        sqlx::query(
            r#"
            INSERT INTO parameter_control_commands
                (id, machine_id, parameter_name, component_parameter_id, target_value,
                 executed_at, completed_at, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(row.id)
        .bind(&row.machine_id)
        .bind(&row.parameter_name)
        .bind(row.component_parameter_id)
        .bind(row.target_value)
        .bind(row.executed_at)
        .bind(row.completed_at)
        .bind(&row.error_message)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn poll_recipe_commands(&self, machine_id: &str) -> PlcResult<Vec<RecipeCommandRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, type, machine_id, parameters, created_at, executed_at
            FROM recipe_commands
            WHERE executed_at IS NULL AND (machine_id = $1 OR machine_id IS NULL)
            ORDER BY created_at ASC
            "#,
        )
        .bind(machine_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| RecipeCommandRow {
                id: row.get("id"),
                command_type: row.get("type"),
                machine_id: row.get("machine_id"),
                parameters: row.get("parameters"),
                created_at: row.get("created_at"),
                executed_at: row.get("executed_at"),
            })
            .collect())
    }

    async fn claim_recipe_command(&self, id: Uuid) -> PlcResult<bool> {
        let result = sqlx::query(
            "UPDATE recipe_commands SET executed_at = now() WHERE id = $1 AND executed_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn poll_parameter_control_commands(
        &self,
        machine_id: &str,
    ) -> PlcResult<Vec<ParameterControlCommandRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, machine_id, parameter_name, component_parameter_id, target_value,
                   executed_at, completed_at, error_message
            FROM parameter_control_commands
            WHERE executed_at IS NULL AND (machine_id = $1 OR machine_id IS NULL)
            ORDER BY executed_at ASC NULLS FIRST
            "#,
        )
        .bind(machine_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| ParameterControlCommandRow {
                id: row.get("id"),
                machine_id: row.get("machine_id"),
                parameter_name: row.get("parameter_name"),
                component_parameter_id: row.get("component_parameter_id"),
                target_value: row.get("target_value"),
                executed_at: row.get("executed_at"),
                completed_at: row.get("completed_at"),
                error_message: row.get("error_message"),
            })
            .collect())
    }

    async fn claim_parameter_control_command(&self, id: Uuid) -> PlcResult<bool> {
        let result = sqlx::query(
            "UPDATE parameter_control_commands SET executed_at = now() WHERE id = $1 AND executed_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_parameter_control_command(
        &self,
        id: Uuid,
        error_message: Option<String>,
    ) -> PlcResult<()> {
        sqlx::query(
            "UPDATE parameter_control_commands SET completed_at = now(), error_message = $1 WHERE id = $2",
        )
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn insert_emergency_signal(
        &self,
        source: &str,
        reason: &str,
        severity: &str,
    ) -> PlcResult<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO emergency_signal (id, source, reason, severity, created_at) VALUES ($1, $2, $3, $4, now())",
        )
        .bind(id)
        .bind(source)
        .bind(reason)
        .bind(severity)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(id)
    }

    async fn poll_emergency_signals_since(
        &self,
        since: DateTime<Utc>,
    ) -> PlcResult<Vec<EmergencySignalRow>> {
        let rows = sqlx::query(
            "SELECT id, source, reason, severity, created_at FROM emergency_signal WHERE created_at > $1 ORDER BY created_at ASC",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| EmergencySignalRow {
                id: row.get("id"),
                source: row.get("source"),
                reason: row.get("reason"),
                severity: row.get("severity"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    async fn insert_emergency_reset(&self, source: &str) -> PlcResult<()> {
        sqlx::query(
            "INSERT INTO emergency_signal (id, source, reason, severity, created_at) VALUES ($1, $2, 'reset', 'reset', now())",
        )
        .bind(Uuid::new_v4())
        .bind(source)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn latest_emergency_reset_at(&self) -> PlcResult<Option<DateTime<Utc>>> {
        let row = sqlx::query(
            "SELECT created_at FROM emergency_signal WHERE severity = 'reset' ORDER BY created_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(|r| r.get("created_at")))
    }

    async fn acquire_plc_lease(&self, holder: &str, ttl_seconds: i64) -> PlcResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO plc_lease (resource, holder, expires_at)
            VALUES ('plc', $1, now() + ($2 || ' seconds')::interval)
            ON CONFLICT (resource) DO UPDATE SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE plc_lease.expires_at < now() OR plc_lease.holder = EXCLUDED.holder
            "#,
        )
        .bind(holder)
        .bind(ttl_seconds.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn renew_plc_lease(&self, holder: &str, ttl_seconds: i64) -> PlcResult<bool> {
        let result = sqlx::query(
            "UPDATE plc_lease SET expires_at = now() + ($1 || ' seconds')::interval WHERE resource = 'plc' AND holder = $2",
        )
        .bind(ttl_seconds.to_string())
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn current_plc_lease_holder(&self) -> PlcResult<Option<String>> {
        let row = sqlx::query(
            "SELECT holder FROM plc_lease WHERE resource = 'plc' AND expires_at > now()",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(row.map(|r| r.get("holder")))
    }

    async fn acquire_valve_lock(
        &self,
        valve_number: u32,
        holder: &str,
        operation_id: Uuid,
        ttl_seconds: i64,
    ) -> PlcResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO valve_locks (valve_number, holder, operation_id, expires_at)
            VALUES ($1, $2, $3, now() + ($4 || ' seconds')::interval)
            ON CONFLICT (valve_number) DO UPDATE SET
                holder = EXCLUDED.holder,
                operation_id = EXCLUDED.operation_id,
                expires_at = EXCLUDED.expires_at
            WHERE valve_locks.expires_at < now()
            "#,
        )
        .bind(valve_number as i32)
        .bind(holder)
        .bind(operation_id)
        .bind(ttl_seconds.to_string())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_valve_lock(&self, valve_number: u32, operation_id: Uuid) -> PlcResult<()> {
        sqlx::query("DELETE FROM valve_locks WHERE valve_number = $1 AND operation_id = $2")
            .bind(valve_number as i32)
            .bind(operation_id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn submit_valve_op(&self, row: ValveOpRow) -> PlcResult<()> {
        sqlx::query(
            r#"
            INSERT INTO valve_ops (id, coil_address, value, requested_by, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(row.id)
        .bind(row.coil_address as i32)
        .bind(row.value)
        .bind(&row.requested_by)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn poll_pending_valve_ops(&self) -> PlcResult<Vec<ValveOpRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, coil_address, value, requested_by, created_at, claimed_at,
                   completed_at, error_message
            FROM valve_ops
            WHERE claimed_at IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| ValveOpRow {
                id: row.get("id"),
                coil_address: row.get::<i32, _>("coil_address") as u16,
                value: row.get("value"),
                requested_by: row.get("requested_by"),
                created_at: row.get("created_at"),
                claimed_at: row.get("claimed_at"),
                completed_at: row.get("completed_at"),
                error_message: row.get("error_message"),
            })
            .collect())
    }

    async fn claim_valve_op(&self, id: Uuid) -> PlcResult<bool> {
        let result = sqlx::query(
            "UPDATE valve_ops SET claimed_at = now() WHERE id = $1 AND claimed_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_valve_op(&self, id: Uuid, error_message: Option<String>) -> PlcResult<()> {
        sqlx::query("UPDATE valve_ops SET completed_at = now(), error_message = $1 WHERE id = $2")
            .bind(error_message)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_valve_op(&self, id: Uuid) -> PlcResult<Option<ValveOpRow>> {
        let row = sqlx::query(
            r#"
            SELECT id, coil_address, value, requested_by, created_at, claimed_at,
                   completed_at, error_message
            FROM valve_ops
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(row.map(|row| ValveOpRow {
            id: row.get("id"),
            coil_address: row.get::<i32, _>("coil_address") as u16,
            value: row.get("value"),
            requested_by: row.get("requested_by"),
            created_at: row.get("created_at"),
            claimed_at: row.get("claimed_at"),
            completed_at: row.get("completed_at"),
            error_message: row.get("error_message"),
        }))
    }

    async fn submit_parameter_op(&self, row: ParameterOpRow) -> PlcResult<()> {
        sqlx::query(
            r#"
            INSERT INTO parameter_ops
                (id, address, data_type, kind, write_value, requested_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(row.id)
        .bind(row.address as i32)
        .bind(data_type_to_str(row.data_type))
        .bind(parameter_op_kind_to_str(row.kind))
        .bind(row.write_value)
        .bind(&row.requested_by)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn poll_pending_parameter_ops(&self) -> PlcResult<Vec<ParameterOpRow>> {
        let rows = sqlx::query(
            r#"
            SELECT id, address, data_type, kind, write_value, requested_by, created_at,
                   claimed_at, completed_at, result_value, error_message
            FROM parameter_ops
            WHERE claimed_at IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(rows
            .into_iter()
            .map(|row| ParameterOpRow {
                id: row.get("id"),
                address: row.get::<i32, _>("address") as u16,
                data_type: data_type_from_str(row.get("data_type")),
                kind: parameter_op_kind_from_str(row.get("kind")),
                write_value: row.get("write_value"),
                requested_by: row.get("requested_by"),
                created_at: row.get("created_at"),
                claimed_at: row.get("claimed_at"),
                completed_at: row.get("completed_at"),
                result_value: row.get("result_value"),
                error_message: row.get("error_message"),
            })
            .collect())
    }

    async fn claim_parameter_op(&self, id: Uuid) -> PlcResult<bool> {
        let result = sqlx::query(
            "UPDATE parameter_ops SET claimed_at = now() WHERE id = $1 AND claimed_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_parameter_op(
        &self,
        id: Uuid,
        result_value: Option<f64>,
        error_message: Option<String>,
    ) -> PlcResult<()> {
        sqlx::query(
            "UPDATE parameter_ops SET completed_at = now(), result_value = $1, error_message = $2 WHERE id = $3",
        )
        .bind(result_value)
        .bind(error_message)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn get_parameter_op(&self, id: Uuid) -> PlcResult<Option<ParameterOpRow>> {
        let row = sqlx::query(
            r#"
            SELECT id, address, data_type, kind, write_value, requested_by, created_at,
                   claimed_at, completed_at, result_value, error_message
            FROM parameter_ops
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(row.map(|row| ParameterOpRow {
            id: row.get("id"),
            address: row.get::<i32, _>("address") as u16,
            data_type: data_type_from_str(row.get("data_type")),
            kind: parameter_op_kind_from_str(row.get("kind")),
            write_value: row.get("write_value"),
            requested_by: row.get("requested_by"),
            created_at: row.get("created_at"),
            claimed_at: row.get("claimed_at"),
            completed_at: row.get("completed_at"),
            result_value: row.get("result_value"),
            error_message: row.get("error_message"),
        }))
    }
}
