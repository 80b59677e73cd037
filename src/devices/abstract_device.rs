//! Device without a transport of its own.
//!
//! Reports which timeline objects were added, changed or removed per layer.
//! Useful for driving external automation and for observing the conductor.

use serde::Serialize;

use super::state::{PlannedCommand, Reconciler};
use crate::core::{CommandWithContext, SendMode};
use crate::timeline::{Content, Mappings, TimelineState};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "commandName", rename_all = "camelCase")]
pub enum AbstractCommand {
    Added {
        layer: String,
        content: Content,
    },
    #[serde(rename_all = "camelCase")]
    Changed {
        layer: String,
        from_id: String,
        content: Content,
    },
    Removed {
        layer: String,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AbstractReconciler;

fn planned(command: AbstractCommand, context: String, obj_id: &str) -> PlannedCommand {
    let value = serde_json::to_value(&command).unwrap_or_default();
    PlannedCommand::at_state(CommandWithContext::new(value, context, obj_id))
}

impl Reconciler for AbstractReconciler {
    type State = TimelineState;

    fn send_mode(&self) -> SendMode {
        SendMode::Burst
    }

    fn default_state(&self) -> TimelineState {
        TimelineState::empty(0)
    }

    fn convert(&self, state: &TimelineState, _mappings: &Mappings) -> TimelineState {
        state.clone()
    }

    fn diff(&self, old: &TimelineState, new: &TimelineState) -> Vec<PlannedCommand> {
        let mut commands = Vec::new();

        for (layer, obj) in &new.layers {
            match old.layers.get(layer) {
                None => commands.push(planned(
                    AbstractCommand::Added {
                        layer: layer.clone(),
                        content: obj.content.clone(),
                    },
                    format!("added: {}", obj.id),
                    &obj.id,
                )),
                Some(prev) if prev.id != obj.id || prev.content != obj.content => {
                    commands.push(planned(
                        AbstractCommand::Changed {
                            layer: layer.clone(),
                            from_id: prev.id.clone(),
                            content: obj.content.clone(),
                        },
                        format!("changed: {}", obj.id),
                        &obj.id,
                    ))
                }
                Some(_) => {}
            }
        }

        for (layer, prev) in &old.layers {
            if !new.layers.contains_key(layer) {
                commands.push(planned(
                    AbstractCommand::Removed {
                        layer: layer.clone(),
                    },
                    format!("removed: {}", prev.id),
                    &prev.id,
                ));
            }
        }

        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{ResolvedObject, ResolvedTimes};

    fn state(objects: &[(&str, &str)]) -> TimelineState {
        let mut state = TimelineState::empty(0);
        for (layer, id) in objects {
            state.layers.insert(
                layer.to_string(),
                ResolvedObject {
                    id: id.to_string(),
                    layer: layer.to_string(),
                    original_layer: None,
                    parent_id: None,
                    is_group: false,
                    priority: 0,
                    content: Content::default(),
                    resolved: ResolvedTimes { start: 0, end: None },
                },
            );
        }
        state
    }

    fn contexts(commands: &[PlannedCommand]) -> Vec<&str> {
        commands.iter().map(|c| c.command.context.as_str()).collect()
    }

    #[test]
    fn test_added_changed_removed() {
        let r = AbstractReconciler;
        let old = state(&[("a", "A"), ("b", "B")]);
        let new = state(&[("a", "A2"), ("c", "C")]);

        let commands = r.diff(&old, &new);
        assert_eq!(contexts(&commands), vec!["changed: A2", "added: C", "removed: B"]);
        assert_eq!(commands[0].command.command["commandName"], "changed");
        assert_eq!(commands[0].command.command["fromId"], "A");
        assert_eq!(commands[2].command.timeline_obj_id, "B");
    }

    #[test]
    fn test_content_change_counts_as_changed() {
        let r = AbstractReconciler;
        let old = state(&[("a", "A")]);
        let mut new = old.clone();
        if let Some(obj) = new.layers.get_mut("a") {
            obj.content = Content::default().with_attr("volume", 3);
        }

        assert_eq!(contexts(&r.diff(&old, &new)), vec!["changed: A"]);
    }

    #[test]
    fn test_identical_states_produce_nothing() {
        let r = AbstractReconciler;
        let s = state(&[("a", "A")]);
        assert!(r.diff(&s, &s).is_empty());
        assert_eq!(r.send_mode(), SendMode::Burst);
    }
}
