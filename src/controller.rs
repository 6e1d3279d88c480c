//! Parameter Controller (spec §4.G): validates and writes ad-hoc
//! parameter-control commands, then verifies the write against a
//! read-back tolerance. The command row itself is the audit record —
//! no separate audit row is written here, unlike the Recipe Executor.

use crate::codec::{DataType, RawValue};
use crate::coordination::EmergencyMonitor;
use crate::error::PlcResult;
use crate::plc::PlcClient;
use crate::registry::{Parameter, Registry};
use crate::store::{ParameterControlCommandRow, Store};
use log::warn;
use std::sync::Arc;
use std::time::Duration;

const READ_BACK_DELAY: Duration = Duration::from_millis(200);

/// A resolved write target, covering both the common case (a registry
/// entry) and the raw-address escape hatch spec §4.G allows when no
/// registry entry exists.
enum Target<'a> {
    Registry(&'a Parameter),
    RawAddress { address: u16, data_type: DataType },
}

pub struct ParameterController {
    plc: Arc<dyn PlcClient>,
    registry: Arc<Registry>,
    store: Arc<dyn Store>,
    emergency: Arc<EmergencyMonitor>,
}

impl ParameterController {
    pub fn new(
        plc: Arc<dyn PlcClient>,
        registry: Arc<Registry>,
        store: Arc<dyn Store>,
        emergency: Arc<EmergencyMonitor>,
    ) -> Self {
        ParameterController {
            plc,
            registry,
            store,
            emergency,
        }
    }

    /// Processes one already-claimed command row end to end: resolve,
    /// validate, set `executed_at`, write, read back and verify, set
    /// `completed_at`. Failures are recorded into the row's
    /// `error_message` rather than propagated — a bad command must not
    /// take the controller down.
    pub async fn handle(&self, command: ParameterControlCommandRow, raw_address: Option<u16>, raw_data_type: Option<DataType>) {
        if self.emergency.is_in_emergency_state() {
            warn!("parameter control command {} rejected: emergency state active", command.id);
            self.complete(command.id, Some("rejected: emergency state active".to_owned())).await;
            return;
        }

        let target = match self.resolve(&command, raw_address, raw_data_type) {
            Ok(t) => t,
            Err(e) => {
                warn!("parameter control command {} could not be resolved: {e}", command.id);
                self.complete(command.id, Some(e.to_string())).await;
                return;
            }
        };

        let (min_value, max_value, write_address, read_address, data_type, scaling) = match &target {
            Target::Registry(p) => (p.min_value, p.max_value, p.write_address, p.read_address, p.data_type, p.scaling),
            Target::RawAddress { address, data_type } => (None, None, Some(*address), Some(*address), *data_type, None),
        };

        if let (Some(min), Some(max)) = (min_value, max_value) {
            if command.target_value < min || command.target_value > max {
                let message = format!("value {} out of range [{min}, {max}]", command.target_value);
                warn!("parameter control command {}: {message}", command.id);
                self.complete(command.id, Some(message)).await;
                return;
            }
        }

        let Some(write_address) = write_address else {
            self.complete(command.id, Some("no write address configured".to_owned())).await;
            return;
        };

        let raw_write = match scaling {
            Some(s) => s.to_raw_voltage(command.target_value),
            None => command.target_value,
        };

        let write_result = self
            .plc
            .write_value(write_address, encode_for(data_type, raw_write))
            .await;
        if let Err(e) = write_result {
            warn!("parameter control command {} write failed: {e}", command.id);
            self.complete(command.id, Some(e.to_string())).await;
            return;
        }

        tokio::time::sleep(READ_BACK_DELAY).await;
        let read_address = read_address.unwrap_or(write_address);
        let error_message = match self.plc.read_value(read_address, data_type).await {
            Ok(read_raw) => {
                let read_eu = match scaling {
                    Some(s) => s.to_engineering_units(read_raw.as_f64()),
                    None => read_raw.as_f64(),
                };
                let tolerance = verify_tolerance(min_value, max_value);
                if (read_eu - command.target_value).abs() > tolerance {
                    Some(format!(
                        "verify failed: wrote {}, read back {read_eu} (tolerance {tolerance})",
                        command.target_value
                    ))
                } else {
                    None
                }
            }
            Err(e) => Some(format!("read-back failed: {e}")),
        };

        self.complete(command.id, error_message).await;
    }

    fn resolve<'a>(
        &'a self,
        command: &ParameterControlCommandRow,
        raw_address: Option<u16>,
        raw_data_type: Option<DataType>,
    ) -> PlcResult<Target<'a>> {
        if let Some(id) = command.component_parameter_id {
            return Ok(Target::Registry(self.registry.parameter(id)?));
        }
        if let Some(name) = &command.parameter_name {
            return Ok(Target::Registry(self.registry.parameter_by_name(name)?));
        }
        if let (Some(address), Some(data_type)) = (raw_address, raw_data_type) {
            return Ok(Target::RawAddress { address, data_type });
        }
        Err(crate::error::PlcError::not_configured(
            "parameter control command has no component_parameter_id, parameter_name, or raw address",
        ))
    }

    async fn complete(&self, id: uuid::Uuid, error_message: Option<String>) {
        if let Err(e) = self.store.complete_parameter_control_command(id, error_message).await {
            warn!("failed to mark parameter control command {id} complete: {e}");
        }
    }
}

fn verify_tolerance(min: Option<f64>, max: Option<f64>) -> f64 {
    match (min, max) {
        (Some(min), Some(max)) => ((max - min) * 0.01).max(0.01),
        _ => 0.01,
    }
}

fn encode_for(ty: DataType, value: f64) -> RawValue {
    match ty {
        DataType::U16 => RawValue::U16(value.round().clamp(0.0, u16::MAX as f64) as u16),
        DataType::I16 => RawValue::I16(value.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16),
        DataType::U32 => RawValue::U32(value.round().clamp(0.0, u32::MAX as f64) as u32),
        DataType::I32 => RawValue::I32(value.round().clamp(i32::MIN as f64, i32::MAX as f64) as i32),
        DataType::F32 => RawValue::F32(value as f32),
        DataType::Bool => RawValue::Bool(value != 0.0),
    }
}
