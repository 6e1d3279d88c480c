//! Recipe step tree types and the step-parameter shapes from a recipe's
//! `parameters` JSON column (spec §3, §4.F).

pub mod executor;

use crate::error::{PlcError, PlcResult};
use crate::store::RecipeStepRow;
use serde::Deserialize;
use std::collections::HashMap;
use uuid::Uuid;

pub use executor::RecipeExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValveState {
    Open,
    Close,
    Pulse,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValveStepParams {
    pub valve_number: Option<u32>,
    pub valve_param_id: Option<i64>,
    pub state: ValveState,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PurgeStepParams {
    pub gas_type: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetParameterStepParams {
    pub parameter_name: Option<String>,
    pub component_parameter_id: Option<i64>,
    pub value: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoopStepParams {
    pub count: u32,
}

pub fn parse_params<T: for<'de> Deserialize<'de>>(row: &RecipeStepRow) -> PlcResult<T> {
    serde_json::from_value(row.parameters.clone())
        .map_err(|e| PlcError::fatal(format!("step {} has malformed parameters: {e}", row.id)))
}

/// A top-level step plus, for `loop` steps only, its contiguous children
/// in ascending `sequence_number` order. A `loop` step's children are
/// never themselves top-level — nested loops are out of scope (spec §3),
/// so one level of nesting is all this tree needs to represent.
pub struct StepNode {
    pub row: RecipeStepRow,
    pub children: Vec<RecipeStepRow>,
}

/// Builds the step tree described in spec §4.F's Traversal paragraph:
/// parent steps and their children form intervals, and a loop header's
/// children are excluded from the outer walk.
pub fn build_step_tree(mut steps: Vec<RecipeStepRow>) -> Vec<StepNode> {
    steps.sort_by_key(|s| s.sequence_number);

    let mut children_by_parent: HashMap<Uuid, Vec<RecipeStepRow>> = HashMap::new();
    for step in &steps {
        if let Some(parent) = step.parent_step_id {
            children_by_parent.entry(parent).or_default().push(step.clone());
        }
    }
    for children in children_by_parent.values_mut() {
        children.sort_by_key(|c| c.sequence_number);
    }

    steps
        .into_iter()
        .filter(|s| s.parent_step_id.is_none())
        .map(|row| {
            let children = children_by_parent.remove(&row.id).unwrap_or_default();
            StepNode { row, children }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: Uuid, seq: i32, parent: Option<Uuid>, kind: &str) -> RecipeStepRow {
        RecipeStepRow {
            id,
            recipe_id: Uuid::nil(),
            sequence_number: seq,
            parent_step_id: parent,
            step_type: kind.to_owned(),
            parameters: serde_json::json!({}),
        }
    }

    #[test]
    fn loop_children_are_excluded_from_the_top_level_walk() {
        let loop_id = Uuid::new_v4();
        let steps = vec![
            step(Uuid::new_v4(), 0, None, "valve"),
            step(loop_id, 1, None, "loop"),
            step(Uuid::new_v4(), 2, Some(loop_id), "valve"),
            step(Uuid::new_v4(), 3, Some(loop_id), "purge"),
            step(Uuid::new_v4(), 4, None, "set_parameter"),
        ];
        let tree = build_step_tree(steps);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree[1].row.id, loop_id);
        assert_eq!(tree[1].children.len(), 2);
        assert!(tree[0].children.is_empty());
    }

    #[test]
    fn children_are_ordered_by_sequence_number() {
        let loop_id = Uuid::new_v4();
        let second = Uuid::new_v4();
        let first = Uuid::new_v4();
        let steps = vec![
            step(loop_id, 0, None, "loop"),
            step(second, 2, Some(loop_id), "valve"),
            step(first, 1, Some(loop_id), "valve"),
        ];
        let tree = build_step_tree(steps);
        assert_eq!(tree[0].children[0].id, first);
        assert_eq!(tree[0].children[1].id, second);
    }
}
