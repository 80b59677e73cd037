//! Timeline data model: objects, triggers, mappings and resolved state.
//!
//! Objects are replaced wholesale on every external update. A resolved state
//! is recomputed every pass and never outlives the pass that diffs it.

pub mod resolver;

pub use resolver::{BasicResolver, DevelopedTimeline, TimelineResolver};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::types::{DeviceId, DeviceType, Time};

/// When an object (or keyframe) starts or ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawTrigger", into = "RawTrigger")]
pub enum Trigger {
    /// Absolute time; relative to the parent's start for grouped objects.
    Absolute(Time),
    /// Reference expression such as `#intro.end + 500`.
    Expression(String),
    /// Literal "now"; fixed to a concrete time during a resolve pass.
    Now,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawTrigger {
    Time(Time),
    Text(String),
}

impl From<RawTrigger> for Trigger {
    fn from(raw: RawTrigger) -> Self {
        match raw {
            RawTrigger::Time(t) => Trigger::Absolute(t),
            RawTrigger::Text(s) if s.trim() == "now" => Trigger::Now,
            RawTrigger::Text(s) => match s.trim().parse::<Time>() {
                Ok(t) => Trigger::Absolute(t),
                Err(_) => Trigger::Expression(s),
            },
        }
    }
}

impl From<Trigger> for RawTrigger {
    fn from(trigger: Trigger) -> Self {
        match trigger {
            Trigger::Absolute(t) => RawTrigger::Time(t),
            Trigger::Expression(s) => RawTrigger::Text(s),
            Trigger::Now => RawTrigger::Text("now".to_string()),
        }
    }
}

impl Trigger {
    pub fn is_now(&self) -> bool {
        matches!(self, Trigger::Now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enable {
    pub start: Trigger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<Trigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<Time>,
}

impl Enable {
    pub fn at(start: Time) -> Self {
        Self::from_trigger(Trigger::Absolute(start))
    }

    pub fn expression(expr: impl Into<String>) -> Self {
        Self::from_trigger(Trigger::Expression(expr.into()))
    }

    pub fn now() -> Self {
        Self::from_trigger(Trigger::Now)
    }

    pub fn from_trigger(start: Trigger) -> Self {
        Self {
            start,
            end: None,
            duration: None,
        }
    }

    pub fn with_duration(mut self, duration: Time) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_end(mut self, end: Trigger) -> Self {
        self.end = Some(end);
        self
    }
}

/// Object payload: the device-type tag, optional callbacks, and free-form
/// device-specific attributes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    #[serde(default, rename = "callBack", skip_serializing_if = "Option::is_none")]
    pub callback: Option<String>,
    #[serde(default, rename = "callBackStopped", skip_serializing_if = "Option::is_none")]
    pub callback_stopped: Option<String>,
    #[serde(default, rename = "callBackData", skip_serializing_if = "Option::is_none")]
    pub callback_data: Option<Value>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Content {
    pub fn for_device(device_type: DeviceType) -> Self {
        Self {
            device_type: Some(device_type),
            ..Default::default()
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn has_callbacks(&self) -> bool {
        self.callback.is_some() || self.callback_stopped.is_some()
    }
}

/// Attribute overrides active for part of an object's lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    pub id: String,
    /// Relative to the owning object's resolved start.
    pub enable: Enable,
    #[serde(default)]
    pub content: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineObject {
    pub id: String,
    #[serde(default)]
    pub layer: String,
    pub enable: Enable,
    #[serde(default)]
    pub content: Content,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TimelineObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keyframes: Vec<Keyframe>,
}

impl TimelineObject {
    pub fn new(id: impl Into<String>, layer: impl Into<String>, enable: Enable) -> Self {
        Self {
            id: id.into(),
            layer: layer.into(),
            enable,
            content: Content::default(),
            priority: 0,
            is_group: false,
            children: Vec::new(),
            keyframes: Vec::new(),
        }
    }

    pub fn group(id: impl Into<String>, enable: Enable, children: Vec<TimelineObject>) -> Self {
        let mut group = Self::new(id, "", enable);
        group.is_group = true;
        group.children = children;
        group
    }

    pub fn with_content(mut self, content: Content) -> Self {
        self.content = content;
        self
    }
}

/// Routes a layer to exactly one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    pub device: DeviceType,
    pub device_id: DeviceId,
    /// Device-specific routing (channel, index, mapping type...).
    #[serde(flatten)]
    pub options: Map<String, Value>,
}

impl Mapping {
    pub fn new(device: DeviceType, device_id: impl Into<DeviceId>) -> Self {
        Self {
            device,
            device_id: device_id.into(),
            options: Map::new(),
        }
    }

    pub fn with_option(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    pub fn routes_to(&self, device_id: &DeviceId, device_type: &DeviceType) -> bool {
        &self.device_id == device_id && &self.device == device_type
    }
}

pub type Mappings = BTreeMap<String, Mapping>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTimes {
    pub start: Time,
    pub end: Option<Time>,
}

impl ResolvedTimes {
    pub fn contains(&self, time: Time) -> bool {
        self.start <= time && self.end.is_none_or(|end| time < end)
    }

    pub fn overlaps(&self, from: Time, to: Time) -> bool {
        self.start <= to && self.end.is_none_or(|end| end >= from)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedObject {
    pub id: String,
    pub layer: String,
    /// Layer the object was moved from (lookahead objects keep their mapping).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_layer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub is_group: bool,
    pub priority: i32,
    pub content: Content,
    pub resolved: ResolvedTimes,
}

/// Resolved per-layer state at one instant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TimelineState {
    pub time: Time,
    pub layers: BTreeMap<String, ResolvedObject>,
}

impl TimelineState {
    pub fn empty(time: Time) -> Self {
        Self {
            time,
            layers: BTreeMap::new(),
        }
    }

    /// The subset of layers whose mapping routes to the given device.
    ///
    /// Layers without a mapping are skipped; a lookahead object falls back
    /// to the mapping of its original layer.
    pub fn filter_for_device(
        &self,
        mappings: &Mappings,
        device_id: &DeviceId,
        device_type: &DeviceType,
    ) -> TimelineState {
        let layers = self
            .layers
            .iter()
            .filter(|(layer, obj)| {
                mappings
                    .get(layer.as_str())
                    .or_else(|| obj.original_layer.as_ref().and_then(|l| mappings.get(l)))
                    .is_some_and(|m| m.routes_to(device_id, device_type))
            })
            .map(|(layer, obj)| (layer.clone(), obj.clone()))
            .collect();

        TimelineState {
            time: self.time,
            layers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    End,
    Start,
}

/// A discrete point where the resolved state may change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEvent {
    pub time: Time,
    pub kind: EventKind,
    pub object_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_deserialization() {
        let enable: Enable = serde_json::from_str(r#"{"start": 1000, "duration": 50}"#).unwrap();
        assert_eq!(enable.start, Trigger::Absolute(1000));
        assert_eq!(enable.duration, Some(50));

        let enable: Enable = serde_json::from_str(r##"{"start": "#a.start + 10"}"##).unwrap();
        assert_eq!(enable.start, Trigger::Expression("#a.start + 10".to_string()));

        let enable: Enable = serde_json::from_str(r#"{"start": "now"}"#).unwrap();
        assert!(enable.start.is_now());

        let enable: Enable = serde_json::from_str(r#"{"start": "250"}"#).unwrap();
        assert_eq!(enable.start, Trigger::Absolute(250));
    }

    #[test]
    fn test_content_keeps_callbacks_and_attributes() {
        let content: Content = serde_json::from_value(serde_json::json!({
            "deviceType": "abstract",
            "callBack": "playStarted",
            "callBackData": { "rundown": 1 },
            "file": "amb.mp4"
        }))
        .unwrap();

        assert_eq!(content.device_type, Some(DeviceType::abstract_device()));
        assert_eq!(content.callback.as_deref(), Some("playStarted"));
        assert!(content.has_callbacks());
        assert_eq!(content.attributes.get("file"), Some(&Value::from("amb.mp4")));
        assert!(!content.attributes.contains_key("callBack"));
    }

    #[test]
    fn test_filter_for_device_routes_exclusively() {
        let mut mappings = Mappings::new();
        mappings.insert("a".into(), Mapping::new(DeviceType::abstract_device(), "dev0"));
        mappings.insert("b".into(), Mapping::new(DeviceType::abstract_device(), "dev1"));
        mappings.insert("c".into(), Mapping::new(DeviceType::video_mixer(), "dev0"));

        let mut state = TimelineState::empty(100);
        for layer in ["a", "b", "c", "unmapped"] {
            state.layers.insert(
                layer.to_string(),
                ResolvedObject {
                    id: format!("obj_{layer}"),
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

        let sub = state.filter_for_device(
            &mappings,
            &DeviceId::new("dev0"),
            &DeviceType::abstract_device(),
        );
        assert_eq!(sub.time, 100);
        assert_eq!(sub.layers.keys().collect::<Vec<_>>(), vec!["a"]);
    }
}
