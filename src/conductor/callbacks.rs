//! Start/stop callback bookkeeping.
//!
//! An object carrying `callBack` or `callBackStopped` is tracked under an id
//! derived from its identity, callbacks, start time and data, so a change to
//! any of those counts as a new instance.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::timeline::{ResolvedObject, TimelineState};
use crate::types::Time;

/// Identity of one callback-carrying object instance.
pub fn callback_id(obj: &ResolvedObject) -> String {
    let mut hasher = Sha256::new();
    hasher.update(obj.id.as_bytes());
    hasher.update(obj.content.callback.as_deref().unwrap_or_default().as_bytes());
    hasher.update(
        obj.content
            .callback_stopped
            .as_deref()
            .unwrap_or_default()
            .as_bytes(),
    );
    hasher.update(obj.resolved.start.to_string().as_bytes());
    if let Some(data) = &obj.content.callback_data {
        hasher.update(data.to_string().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallbackRecord {
    pub object_id: String,
    pub callback: Option<String>,
    pub callback_stopped: Option<String>,
    pub data: Option<Value>,
}

impl CallbackRecord {
    fn from_object(obj: &ResolvedObject) -> Self {
        Self {
            object_id: obj.id.clone(),
            callback: obj.content.callback.clone(),
            callback_stopped: obj.content.callback_stopped.clone(),
            data: obj.content.callback_data.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CallbackKind {
    Stop,
    Start,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueuedCallback {
    pub kind: CallbackKind,
    pub time: Time,
    pub id: String,
    pub object_id: String,
    pub callback: String,
    pub data: Option<Value>,
}

/// Callbacks derived from one resolved state.
#[derive(Debug, Default)]
pub struct CallbackPlan {
    /// Everything currently playing; replaces the sent set.
    pub records: HashMap<String, CallbackRecord>,
    /// Starts not announced yet, due at the object's start time.
    pub starts: Vec<QueuedCallback>,
    /// Stops for instances that disappeared, due at the state time.
    pub stops: Vec<QueuedCallback>,
}

/// Compare the objects in `state` against the previous pass.
///
/// `sent` is the record set of the previous pass and `announced` the ids whose
/// start has already fired. A start is planned again until it has fired, so a
/// re-resolve that clears the pending entry cannot lose it.
pub fn plan_callbacks(
    state: &TimelineState,
    sent: &HashMap<String, CallbackRecord>,
    announced: &HashSet<String>,
) -> CallbackPlan {
    let mut plan = CallbackPlan::default();

    for obj in state.layers.values() {
        if !obj.content.has_callbacks() {
            continue;
        }
        let id = callback_id(obj);
        if let Some(callback) = &obj.content.callback {
            if !announced.contains(&id) {
                plan.starts.push(QueuedCallback {
                    kind: CallbackKind::Start,
                    time: obj.resolved.start,
                    id: id.clone(),
                    object_id: obj.id.clone(),
                    callback: callback.clone(),
                    data: obj.content.callback_data.clone(),
                });
            }
        }
        plan.records.insert(id, CallbackRecord::from_object(obj));
    }

    for (id, record) in sent {
        if plan.records.contains_key(id) {
            continue;
        }
        if let Some(callback) = &record.callback_stopped {
            plan.stops.push(QueuedCallback {
                kind: CallbackKind::Stop,
                time: state.time,
                id: id.clone(),
                object_id: record.object_id.clone(),
                callback: callback.clone(),
                data: record.data.clone(),
            });
        }
    }
    plan.stops.sort_by(|a, b| a.object_id.cmp(&b.object_id));

    plan
}

/// Collapse a batch of callbacks before emitting.
///
/// A start and a stop for the same object within `window` of each other
/// cancel out; otherwise the latest callback per object wins. Remaining stops
/// go before starts, then by time.
pub fn debounce_callbacks(batch: Vec<QueuedCallback>, window: Time) -> Vec<QueuedCallback> {
    let mut latest: BTreeMap<String, QueuedCallback> = BTreeMap::new();

    for cb in batch {
        let cancels = latest
            .get(&cb.object_id)
            .is_some_and(|prev| prev.kind != cb.kind && (cb.time - prev.time).abs() < window);
        if cancels {
            latest.remove(&cb.object_id);
        } else {
            latest.insert(cb.object_id.clone(), cb);
        }
    }

    let mut out: Vec<_> = latest.into_values().collect();
    out.sort_by(|a, b| (a.kind, a.time).cmp(&(b.kind, b.time)));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{Content, ResolvedTimes};
    use serde_json::json;

    fn playing(id: &str, start: Time, data: Option<Value>) -> ResolvedObject {
        ResolvedObject {
            id: id.to_string(),
            layer: format!("layer_{id}"),
            original_layer: None,
            parent_id: None,
            is_group: false,
            priority: 0,
            content: Content {
                callback: Some("started".into()),
                callback_stopped: Some("stopped".into()),
                callback_data: data,
                ..Default::default()
            },
            resolved: ResolvedTimes { start, end: None },
        }
    }

    fn state(time: Time, objects: Vec<ResolvedObject>) -> TimelineState {
        let mut state = TimelineState::empty(time);
        for obj in objects {
            state.layers.insert(obj.layer.clone(), obj);
        }
        state
    }

    fn cb(kind: CallbackKind, time: Time, id: &str) -> QueuedCallback {
        QueuedCallback {
            kind,
            time,
            id: id.to_string(),
            object_id: id.to_string(),
            callback: "cb".into(),
            data: None,
        }
    }

    #[test]
    fn test_callback_id_tracks_data_and_start() {
        let a = playing("A", 1000, Some(json!({"clip": 1})));
        assert_eq!(callback_id(&a), callback_id(&a.clone()));
        assert_ne!(callback_id(&a), callback_id(&playing("A", 1000, Some(json!({"clip": 2})))));
        assert_ne!(callback_id(&a), callback_id(&playing("A", 1001, Some(json!({"clip": 1})))));
    }

    #[test]
    fn test_start_then_stop() {
        let none = HashSet::new();
        let first = plan_callbacks(&state(1000, vec![playing("A", 1000, None)]), &HashMap::new(), &none);
        assert_eq!(first.starts.len(), 1);
        assert_eq!(first.starts[0].time, 1000);
        assert_eq!(first.starts[0].callback, "started");
        assert!(first.stops.is_empty());

        // Not fired yet: planned again.
        let pending = plan_callbacks(&state(1000, vec![playing("A", 1000, None)]), &first.records, &none);
        assert_eq!(pending.starts.len(), 1);

        // Fired: nothing new to announce.
        let announced: HashSet<String> = first.records.keys().cloned().collect();
        let again = plan_callbacks(&state(1500, vec![playing("A", 1000, None)]), &first.records, &announced);
        assert!(again.starts.is_empty());
        assert!(again.stops.is_empty());

        let gone = plan_callbacks(&state(3000, vec![]), &again.records, &announced);
        assert_eq!(gone.stops.len(), 1);
        assert_eq!(gone.stops[0].time, 3000);
        assert_eq!(gone.stops[0].callback, "stopped");
        assert!(gone.records.is_empty());
    }

    #[test]
    fn test_objects_without_callbacks_are_ignored() {
        let mut obj = playing("A", 0, None);
        obj.content = Content::default();
        let plan = plan_callbacks(&state(0, vec![obj]), &HashMap::new(), &HashSet::new());
        assert!(plan.records.is_empty());
        assert!(plan.starts.is_empty());
    }

    #[test]
    fn test_debounce_drops_flicker() {
        let out = debounce_callbacks(
            vec![
                cb(CallbackKind::Start, 1000, "x"),
                cb(CallbackKind::Stop, 1020, "x"),
                cb(CallbackKind::Start, 1000, "y"),
                cb(CallbackKind::Stop, 900, "z"),
            ],
            50,
        );
        let ids: Vec<_> = out.iter().map(|c| (c.kind, c.id.as_str())).collect();
        assert_eq!(
            ids,
            vec![(CallbackKind::Stop, "z"), (CallbackKind::Start, "y")]
        );
    }

    #[test]
    fn test_debounce_drops_stop_followed_by_start() {
        let out = debounce_callbacks(
            vec![cb(CallbackKind::Stop, 1000, "x"), cb(CallbackKind::Start, 1030, "x")],
            50,
        );
        assert!(out.is_empty());
    }

    #[test]
    fn test_debounce_keeps_distant_pairs() {
        let out = debounce_callbacks(
            vec![cb(CallbackKind::Start, 1000, "x"), cb(CallbackKind::Stop, 1100, "x")],
            50,
        );
        // Latest wins for the same object.
        assert_eq!(out, vec![cb(CallbackKind::Stop, 1100, "x")]);
    }
}
