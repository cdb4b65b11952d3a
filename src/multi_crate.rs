/*! Multi-crate event merging.

A multi-crate setup runs N controllers whose triggers fire in lockstep for
some events. Downstream consumers want one unified event model: for each
cross-crate event index a single merged event containing every crate's
modules, plus the remaining single-crate events.

Merged objects get fresh ids; a bidirectional mapping between source and
merged ids is produced so that a later re-merge (after a config edit) can
keep the ids of objects it has seen before. Consumers keying histograms or
conditions by object id survive config edits that way.
*/
use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::command::Group;
use crate::config::CrateConfig;

/// Bidirectional id mappings between crate and merged objects.
///
/// `crates_to_merged` is many-to-one for cross-crate events: every source
/// event maps to the one merged event built from it. The reverse map keeps
/// the first contributor, by convention the lowest crate index.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectMappings {
    pub crates_to_merged: BTreeMap<Uuid, Uuid>,
    pub merged_to_crates: BTreeMap<Uuid, Uuid>,
}

impl ObjectMappings {
    pub fn insert(&mut self, crate_object: Uuid, merged_object: Uuid) {
        self.crates_to_merged.insert(crate_object, merged_object);
        self.merged_to_crates.entry(merged_object).or_insert(crate_object);
    }

    #[must_use]
    pub fn merged_id(&self, crate_object: &Uuid) -> Option<Uuid> {
        self.crates_to_merged.get(crate_object).copied()
    }
}

/// Stable ids for one crate's events and modules. Generated once per
/// config and kept across merges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CrateObjectIds {
    pub event_ids: Vec<Uuid>,
    /// Per event, one id per module (readout group).
    pub module_ids: Vec<Vec<Uuid>>,
}

impl CrateObjectIds {
    #[must_use]
    pub fn for_config(config: &CrateConfig) -> CrateObjectIds {
        CrateObjectIds {
            event_ids: config.readout_stacks.iter().map(|_| Uuid::new_v4()).collect(),
            module_ids: config
                .readout_stacks
                .iter()
                .map(|stack| stack.get_groups().iter().map(|_| Uuid::new_v4()).collect())
                .collect(),
        }
    }
}

/// One crate's contribution to a merge.
pub struct MergeInput<'a> {
    pub config: &'a CrateConfig,
    pub ids: &'a CrateObjectIds,
}

/// A module of a merged event, pointing back at its source crate.
#[derive(Clone, Debug, PartialEq)]
pub struct MergedModule {
    pub id: Uuid,
    pub source_crate: u8,
    pub source_event: u8,
    pub source_module: u8,
    pub group: Group,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MergedEvent {
    pub id: Uuid,
    pub name: String,
    pub cross_crate: bool,
    pub modules: Vec<MergedModule>,
}

/// The unified cross-crate event model.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MergedConfig {
    pub events: Vec<MergedEvent>,
}

fn merged_id_for(prev: &ObjectMappings, source: Uuid, mappings: &mut ObjectMappings) -> Uuid {
    let id = prev.merged_id(&source).unwrap_or_else(Uuid::new_v4);
    mappings.insert(source, id);
    id
}

/// Merge N crate configs into one event model.
///
/// Events are ordered: cross-crate events first, by ascending event index,
/// each containing the union of all crates' modules for that index with
/// crate 0's modules first; then the remaining events in (crate, event)
/// lexicographic order.
///
/// Passing the mappings returned by a previous merge keeps the merged ids
/// of already-known source objects.
pub fn make_merged_config(
    inputs: &[MergeInput],
    cross_crate_events: &BTreeSet<u8>,
    prev: &ObjectMappings,
) -> (MergedConfig, ObjectMappings) {
    let mut result = MergedConfig::default();
    let mut mappings = ObjectMappings::default();

    let add_modules_for = |event: &mut MergedEvent, crate_index: usize, event_index: u8, mappings: &mut ObjectMappings| {
        let input = &inputs[crate_index];
        let Some(stack) = input.config.readout_stacks.get(usize::from(event_index)) else {
            return;
        };

        for (mi, group) in stack.get_groups().iter().enumerate() {
            let source_id = input.ids.module_ids[usize::from(event_index)][mi];
            let merged = merged_id_for(prev, source_id, mappings);

            event.modules.push(MergedModule {
                id: merged,
                source_crate: input.config.crate_id,
                source_event: event_index,
                source_module: mi as u8,
                group: group.clone(),
            });
        }
    };

    // Cross-crate events: one merged event per listed index.
    for &event_index in cross_crate_events {
        let mut event = MergedEvent {
            id: Uuid::nil(),
            name: format!("event{event_index}"),
            cross_crate: true,
            modules: Vec::new(),
        };

        // The merged event keeps the id mapped from the first contributing
        // source event.
        let mut merged_event_id = None;

        for (crate_index, input) in inputs.iter().enumerate() {
            let Some(&source_id) = input.ids.event_ids.get(usize::from(event_index)) else {
                continue;
            };

            let id = match merged_event_id {
                Some(id) => {
                    mappings.insert(source_id, id);
                    id
                }
                None => {
                    let id = merged_id_for(prev, source_id, &mut mappings);
                    merged_event_id = Some(id);
                    id
                }
            };
            event.id = id;

            add_modules_for(&mut event, crate_index, event_index, &mut mappings);
        }

        if merged_event_id.is_some() {
            result.events.push(event);
        }
    }

    // Remaining single-crate events in (crate, event) order.
    for (crate_index, input) in inputs.iter().enumerate() {
        for event_index in 0..input.config.readout_stacks.len() as u8 {
            if cross_crate_events.contains(&event_index) {
                continue;
            }

            let source_id = input.ids.event_ids[usize::from(event_index)];
            let id = merged_id_for(prev, source_id, &mut mappings);

            let mut event = MergedEvent {
                id,
                name: format!("crate{}_event{event_index}", input.config.crate_id),
                cross_crate: false,
                modules: Vec::new(),
            };

            add_modules_for(&mut event, crate_index, event_index, &mut mappings);
            result.events.push(event);
        }
    }

    (result, mappings)
}
