//! Parameter/Valve Registry (spec §4.C).
//!
//! Loaded once at terminal startup from the store's denormalized
//! parameter view; immutable for the life of the run except for an
//! explicit invalidation reload. Three maps fall out of the same load:
//! parameters by id, valves by number, and the purge trigger.

use crate::codec::DataType;
use crate::error::{PlcError, PlcResult};
use crate::store::ComponentParameterRow;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Parameter {
    pub id: i64,
    pub name: String,
    pub component: String,
    pub read_address: Option<u16>,
    pub write_address: Option<u16>,
    pub data_type: DataType,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub is_writable: bool,
    pub unit: Option<String>,
    pub scaling: Option<ScalingRecord>,
}

/// Linear voltage↔engineering-units map for an MFC or pressure gauge
/// (spec §3 Scaling record). Reads apply the forward map, writes the
/// inverse.
#[derive(Debug, Clone, Copy)]
pub struct ScalingRecord {
    pub v_min: f64,
    pub v_max: f64,
    pub eu_min: f64,
    pub eu_max: f64,
}

impl ScalingRecord {
    pub fn to_engineering_units(&self, raw_voltage: f64) -> f64 {
        let span_v = self.v_max - self.v_min;
        if span_v == 0.0 {
            return self.eu_min;
        }
        self.eu_min + (raw_voltage - self.v_min) * (self.eu_max - self.eu_min) / span_v
    }

    pub fn to_raw_voltage(&self, engineering_value: f64) -> f64 {
        let span_eu = self.eu_max - self.eu_min;
        if span_eu == 0.0 {
            return self.v_min;
        }
        self.v_min + (engineering_value - self.eu_min) * (self.v_max - self.v_min) / span_eu
    }
}

#[derive(Debug, Clone)]
pub struct Valve {
    pub number: u32,
    pub coil_address: u16,
    pub parameter_id: i64,
}

/// Fixed allowlist applied when `essentials_only` is set, for
/// bandwidth-constrained machines (spec §4.C).
const ESSENTIALS: &[&str] = &["flow", "pressure", "power", "temperature"];

fn is_essential(p: &ComponentParameterRow) -> bool {
    let lower_name = p.parameter_name.to_ascii_lowercase();
    let lower_component = p.component_name.to_ascii_lowercase();
    ESSENTIALS.iter().any(|e| lower_name.contains(e)) || lower_component.starts_with("valve")
}

pub struct Registry {
    parameters_by_id: HashMap<i64, Parameter>,
    valves_by_number: HashMap<u32, Valve>,
    purge_trigger: Option<Parameter>,
}

impl Registry {
    /// Builds a registry from the store's parameter rows plus any
    /// scaling records, applying `essentials_only` filtering if set.
    /// Missing read/write addresses are logged, not rejected — calls
    /// against such parameters fail lazily with `NotConfigured`.
    pub fn build(
        rows: Vec<ComponentParameterRow>,
        scaling: &HashMap<(String, u32), ScalingRecord>,
        essentials_only: bool,
    ) -> Self {
        let mut parameters_by_id = HashMap::new();
        let mut valves_by_number = HashMap::new();
        let mut purge_trigger = None;

        for row in rows {
            if essentials_only && !is_essential(&row) {
                continue;
            }
            if row.read_modbus_address.is_none() && row.write_modbus_address.is_none() {
                log::warn!(
                    "parameter {} ({}) has no read or write address configured",
                    row.parameter_name,
                    row.component_name
                );
            }

            let scaling_record = scaling_for(&row, scaling);

            let parameter = Parameter {
                id: row.id,
                name: row.parameter_name.clone(),
                component: row.component_name.clone(),
                read_address: row.read_modbus_address,
                write_address: row.write_modbus_address,
                data_type: row.data_type,
                min_value: row.min_value,
                max_value: row.max_value,
                is_writable: row.is_writable,
                unit: row.unit.clone(),
                scaling: scaling_record,
            };

            if row.parameter_name.to_ascii_lowercase().contains("purge") {
                purge_trigger = Some(parameter.clone());
            }

            if let Some(number) = parse_valve_number(&row.component_name) {
                if let Some(addr) = parameter.write_address {
                    valves_by_number.insert(
                        number,
                        Valve {
                            number,
                            coil_address: addr,
                            parameter_id: parameter.id,
                        },
                    );
                }
            }

            parameters_by_id.insert(parameter.id, parameter);
        }

        Registry {
            parameters_by_id,
            valves_by_number,
            purge_trigger,
        }
    }

    pub fn parameter(&self, id: i64) -> PlcResult<&Parameter> {
        self.parameters_by_id
            .get(&id)
            .ok_or_else(|| PlcError::not_configured(format!("parameter id {id}")))
    }

    pub fn parameter_by_name(&self, name: &str) -> PlcResult<&Parameter> {
        self.parameters_by_id
            .values()
            .find(|p| p.name == name)
            .ok_or_else(|| PlcError::not_configured(format!("parameter {name}")))
    }

    pub fn valve(&self, number: u32) -> PlcResult<&Valve> {
        self.valves_by_number
            .get(&number)
            .ok_or_else(|| PlcError::not_configured(format!("valve {number}")))
    }

    pub fn valve_by_parameter_id(&self, parameter_id: i64) -> PlcResult<&Valve> {
        self.valves_by_number
            .values()
            .find(|v| v.parameter_id == parameter_id)
            .ok_or_else(|| PlcError::not_configured(format!("valve for parameter id {parameter_id}")))
    }

    pub fn purge_trigger(&self) -> PlcResult<&Parameter> {
        self.purge_trigger
            .as_ref()
            .ok_or_else(|| PlcError::not_configured("purge trigger"))
    }

    pub fn all_parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.parameters_by_id.values()
    }

    pub fn all_valves(&self) -> impl Iterator<Item = &Valve> {
        self.valves_by_number.values()
    }
}

fn parse_valve_number(component: &str) -> Option<u32> {
    let lower = component.to_ascii_lowercase();
    lower.strip_prefix("valve ")?.trim().parse().ok()
}

fn scaling_for(
    row: &ComponentParameterRow,
    table: &HashMap<(String, u32), ScalingRecord>,
) -> Option<ScalingRecord> {
    let lower_component = row.component_name.to_ascii_lowercase();
    let lower_name = row.parameter_name.to_ascii_lowercase();
    let is_mfc = lower_component.starts_with("mfc") && (lower_name == "flow_read" || lower_name == "flow_set");
    let is_gauge = lower_component.starts_with("pressure gauge")
        && (lower_name == "pressure_read" || lower_name == "pressure_set");
    if !is_mfc && !is_gauge {
        return None;
    }
    let number: u32 = lower_component
        .split_whitespace()
        .last()
        .and_then(|s| s.parse().ok())?;
    let kind = if is_mfc { "mfc" } else { "gauge" };
    table.get(&(kind.to_owned(), number)).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, component: &str, read: Option<u16>, write: Option<u16>) -> ComponentParameterRow {
        ComponentParameterRow {
            id: 1,
            parameter_name: name.to_owned(),
            component_name: component.to_owned(),
            read_modbus_address: read,
            write_modbus_address: write,
            data_type: DataType::F32,
            min_value: None,
            max_value: None,
            is_writable: write.is_some(),
            unit: None,
        }
    }

    #[test]
    fn valve_number_parses_from_component_label() {
        assert_eq!(parse_valve_number("Valve 3"), Some(3));
        assert_eq!(parse_valve_number("MFC 1"), None);
    }

    #[test]
    fn essentials_only_keeps_flow_pressure_power_temperature_and_valves() {
        let rows = vec![
            row("flow_read", "MFC 1", Some(100), None),
            row("some_debug_counter", "Diagnostics", Some(200), None),
            row("state", "Valve 2", None, Some(10)),
        ];
        let registry = Registry::build(rows, &HashMap::new(), true);
        assert!(registry.parameter_by_name("flow_read").is_ok());
        assert!(registry.parameter_by_name("some_debug_counter").is_err());
        assert!(registry.valve(2).is_ok());
    }

    #[test]
    fn missing_address_parameter_fails_lazily_not_at_load() {
        let rows = vec![row("orphan", "Diagnostics", None, None)];
        let registry = Registry::build(rows, &HashMap::new(), false);
        assert!(registry.parameter_by_name("orphan").is_ok());
    }

    #[test]
    fn scaling_applies_forward_and_inverse_map() {
        let scaling = ScalingRecord {
            v_min: 0.0,
            v_max: 10.0,
            eu_min: 0.0,
            eu_max: 100.0,
        };
        assert_eq!(scaling.to_engineering_units(5.0), 50.0);
        assert_eq!(scaling.to_raw_voltage(50.0), 5.0);
    }
}
