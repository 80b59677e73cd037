//! Video mixer device: inputs, mix buses, overlays, outputs and the
//! recording/streaming/external toggles.
//!
//! Layers are routed by a `mappingType` option on the mapping and carry a
//! `type` attribute in their content. Program switches are cued on the
//! preview bus ahead of time.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::state::{PlannedCommand, Reconciler};
use crate::core::{CommandWithContext, SendMode};
use crate::timeline::{Mappings, TimelineState};
use crate::types::Time;

pub const MIX_COUNT: usize = 4;
pub const OVERLAY_COUNT: usize = 6;

/// How far ahead of a program switch the new input is cued.
pub const PRE_ROLL: Time = 1000;

const DEFAULT_OUTPUTS: [&str; 6] = ["2", "3", "4", "External2", "Fullscreen", "Fullscreen2"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub effect: String,
    pub duration: Time,
}

impl Default for Transition {
    fn default() -> Self {
        Self {
            effect: "Cut".to_string(),
            duration: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transform {
    pub zoom: f64,
    pub pan_x: f64,
    pub pan_y: f64,
    pub alpha: f64,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            pan_x: 0.0,
            pan_y: 0.0,
            alpha: 255.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MixerInput {
    pub input_type: Option<String>,
    /// Media to load. The input is renamed to its key once added.
    pub file_path: Option<String>,
    pub playing: bool,
    pub position: Time,
    pub looping: bool,
    pub muted: bool,
    pub volume: i64,
    pub balance: i64,
    pub fade: i64,
    pub transform: Transform,
}

impl Default for MixerInput {
    fn default() -> Self {
        Self {
            input_type: None,
            file_path: None,
            playing: false,
            position: 0,
            looping: false,
            muted: true,
            volume: 100,
            balance: 0,
            fade: 0,
            transform: Transform::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MixState {
    pub program: Option<String>,
    pub preview: Option<String>,
    pub transition: Transition,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MixerOutput {
    pub source: String,
    pub input: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MixerState {
    pub inputs: BTreeMap<String, MixerInput>,
    pub mixes: Vec<MixState>,
    pub overlays: Vec<Option<String>>,
    pub fade_to_black: bool,
    pub fader_position: i64,
    pub recording: bool,
    pub streaming: bool,
    pub external: bool,
    pub outputs: BTreeMap<String, MixerOutput>,
    /// Timeline object responsible for each part of the state.
    pub origins: BTreeMap<String, String>,
}

impl Default for MixerState {
    fn default() -> Self {
        Self {
            inputs: BTreeMap::new(),
            mixes: vec![MixState::default(); MIX_COUNT],
            overlays: vec![None; OVERLAY_COUNT],
            fade_to_black: false,
            fader_position: 0,
            recording: false,
            streaming: false,
            external: false,
            outputs: DEFAULT_OUTPUTS
                .iter()
                .map(|name| {
                    (
                        name.to_string(),
                        MixerOutput {
                            source: "Program".to_string(),
                            input: None,
                        },
                    )
                })
                .collect(),
            origins: BTreeMap::new(),
        }
    }
}

impl MixerState {
    fn origin(&self, key: &str) -> &str {
        self.origins.get(key).map(String::as_str).unwrap_or_default()
    }
}

/// Layer routing, read from the mapping's device-specific options.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "mappingType", rename_all = "camelCase")]
pub enum MixerMapping {
    Program {
        #[serde(default)]
        index: Option<usize>,
    },
    Preview {
        #[serde(default)]
        index: Option<usize>,
    },
    Input {
        #[serde(default)]
        index: Option<Value>,
    },
    AudioChannel {
        #[serde(default)]
        index: Option<Value>,
    },
    Fader,
    Overlay {
        index: usize,
    },
    Recording,
    Streaming,
    External,
    FadeToBlack,
    Output {
        index: String,
    },
}

impl MixerMapping {
    /// Inputs are placed before anything that may modify them.
    fn rank(&self) -> u8 {
        match self {
            MixerMapping::Input { .. } => 0,
            _ => 1,
        }
    }
}

/// Object content, tagged by its `type` attribute.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum MixerContent {
    Program {
        input: Value,
        #[serde(default)]
        transition: Option<Transition>,
    },
    Preview {
        input: Value,
    },
    Input {
        #[serde(default)]
        input_type: Option<String>,
        #[serde(default)]
        file_path: Option<String>,
        #[serde(default)]
        playing: Option<bool>,
        #[serde(default, rename = "loop")]
        looping: Option<bool>,
        #[serde(default)]
        seek: Option<Time>,
        #[serde(default)]
        transform: Option<Transform>,
    },
    Audio {
        #[serde(default)]
        volume: Option<i64>,
        #[serde(default)]
        balance: Option<i64>,
        #[serde(default)]
        muted: Option<bool>,
        #[serde(default)]
        fade: Option<i64>,
    },
    Fader {
        position: i64,
    },
    Overlay {
        input: Value,
    },
    Recording {
        on: bool,
    },
    Streaming {
        on: bool,
    },
    External {
        on: bool,
    },
    FadeToBlack {
        on: bool,
    },
    Output {
        source: String,
        #[serde(default)]
        input: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MixerCommand {
    AddInput { value: String },
    SetInputName { input: String, value: String },
    PauseInput { input: String },
    SetPosition { input: String, value: Time },
    LoopOn { input: String },
    LoopOff { input: String },
    AudioOff { input: String },
    AudioVolume { input: String, value: i64, fade: i64 },
    AudioBalance { input: String, value: i64 },
    AudioOn { input: String },
    SetZoom { input: String, value: f64 },
    SetAlpha { input: String, value: f64 },
    SetPanX { input: String, value: f64 },
    SetPanY { input: String, value: f64 },
    PlayInput { input: String },
    Transition { effect: String, duration: Time, input: String, mix: usize },
    PreviewInput { input: String, mix: usize },
    Fader { value: i64 },
    FadeToBlack,
    OverlayInputIn { input: String, value: usize },
    OverlayInputOut { value: usize },
    StartRecording,
    StopRecording,
    StartStreaming,
    StopStreaming,
    StartExternal,
    StopExternal,
    SetOutput { name: String, value: String, input: Option<String> },
    RemoveInput { input: String },
}

impl MixerCommand {
    fn with_context(self, context: impl Into<String>, obj_id: &str) -> CommandWithContext {
        let value = serde_json::to_value(&self).unwrap_or_default();
        CommandWithContext::new(value, context, obj_id)
    }

    fn planned(self, context: impl Into<String>, obj_id: &str) -> PlannedCommand {
        PlannedCommand::at_state(self.with_context(context, obj_id))
    }
}

/// Inputs may be addressed by number or by name.
fn input_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VideoMixerReconciler;

impl VideoMixerReconciler {
    fn input_entry<'a>(state: &'a mut MixerState, key: &str) -> &'a mut MixerInput {
        state.inputs.entry(key.to_string()).or_default()
    }

    fn apply(
        state: &mut MixerState,
        mapping: &MixerMapping,
        content: MixerContent,
        obj_id: &str,
    ) {
        match (mapping, content) {
            (MixerMapping::Program { index }, MixerContent::Program { input, transition }) => {
                let mix = index.unwrap_or(1).saturating_sub(1);
                let (Some(input), Some(mix_state)) = (input_key(&input), state.mixes.get_mut(mix))
                else {
                    return;
                };
                if mix_state.program.as_ref() != Some(&input) {
                    mix_state.preview = mix_state.program.take();
                    mix_state.program = Some(input);
                    mix_state.transition = transition.unwrap_or_default();
                }
                state.origins.insert(format!("mix:{mix}"), obj_id.to_string());
            }
            (MixerMapping::Preview { index }, MixerContent::Preview { input }) => {
                let mix = index.unwrap_or(1).saturating_sub(1);
                if let (Some(input), Some(mix_state)) = (input_key(&input), state.mixes.get_mut(mix)) {
                    mix_state.preview = Some(input);
                    state.origins.insert(format!("preview:{mix}"), obj_id.to_string());
                }
            }
            (
                MixerMapping::Input { index },
                MixerContent::Input {
                    input_type,
                    file_path,
                    playing,
                    looping,
                    seek,
                    transform,
                },
            ) => {
                let Some(key) = index.as_ref().and_then(input_key).or_else(|| file_path.clone()) else {
                    return;
                };
                let input = Self::input_entry(state, &key);
                if input_type.is_some() {
                    input.input_type = input_type;
                }
                if file_path.is_some() {
                    input.file_path = file_path;
                }
                if let Some(playing) = playing {
                    input.playing = playing;
                }
                if let Some(looping) = looping {
                    input.looping = looping;
                }
                if let Some(seek) = seek {
                    input.position = seek;
                }
                if let Some(transform) = transform {
                    input.transform = transform;
                }
                state.origins.insert(format!("input:{key}"), obj_id.to_string());
            }
            (
                MixerMapping::AudioChannel { index },
                MixerContent::Audio {
                    volume,
                    balance,
                    muted,
                    fade,
                },
            ) => {
                let Some(key) = index.as_ref().and_then(input_key) else {
                    return;
                };
                let input = Self::input_entry(state, &key);
                if let Some(volume) = volume {
                    input.volume = volume;
                }
                if let Some(balance) = balance {
                    input.balance = balance;
                }
                if let Some(muted) = muted {
                    input.muted = muted;
                }
                if let Some(fade) = fade {
                    input.fade = fade;
                }
                state
                    .origins
                    .entry(format!("input:{key}"))
                    .or_insert_with(|| obj_id.to_string());
            }
            (MixerMapping::Fader, MixerContent::Fader { position }) => {
                state.fader_position = position;
                state.origins.insert("fader".into(), obj_id.to_string());
            }
            (MixerMapping::Overlay { index }, MixerContent::Overlay { input }) => {
                if let Some(slot) = index
                    .checked_sub(1)
                    .and_then(|i| state.overlays.get_mut(i))
                {
                    *slot = input_key(&input);
                    state.origins.insert(format!("overlay:{index}"), obj_id.to_string());
                }
            }
            (MixerMapping::Recording, MixerContent::Recording { on }) => {
                state.recording = on;
                state.origins.insert("recording".into(), obj_id.to_string());
            }
            (MixerMapping::Streaming, MixerContent::Streaming { on }) => {
                state.streaming = on;
                state.origins.insert("streaming".into(), obj_id.to_string());
            }
            (MixerMapping::External, MixerContent::External { on }) => {
                state.external = on;
                state.origins.insert("external".into(), obj_id.to_string());
            }
            (MixerMapping::FadeToBlack, MixerContent::FadeToBlack { on }) => {
                state.fade_to_black = on;
                state.origins.insert("fadeToBlack".into(), obj_id.to_string());
            }
            (MixerMapping::Output { index }, MixerContent::Output { source, input }) => {
                state.outputs.insert(
                    index.clone(),
                    MixerOutput {
                        source,
                        input: input.as_ref().and_then(input_key),
                    },
                );
                state.origins.insert(format!("output:{index}"), obj_id.to_string());
            }
            (mapping, content) => {
                tracing::debug!(
                    "Ignoring {:?} content on {:?} mapping ({})",
                    content,
                    mapping,
                    obj_id
                );
            }
        }
    }

    fn diff_inputs(old: &MixerState, new: &MixerState, out: &mut Vec<PlannedCommand>) {
        let default_input = MixerInput::default();

        for (key, input) in &new.inputs {
            let origin = new.origin(&format!("input:{key}"));
            let source = input.file_path.as_deref().unwrap_or(key);
            let ctx = |what: &str| format!("{what}: input {key}");

            if !old.inputs.contains_key(key) {
                if let Some(input_type) = &input.input_type {
                    out.push(MixerCommand::AddInput {
                        value: format!("{input_type}|{source}"),
                    }
                    .planned(ctx("add"), origin));
                    out.push(MixerCommand::SetInputName {
                        input: file_name(source).to_string(),
                        value: key.clone(),
                    }
                    .planned(ctx("name"), origin));
                }
            }

            let prev = old.inputs.get(key).unwrap_or(&default_input);
            let key = key.clone();

            if prev.playing != input.playing && !input.playing {
                out.push(MixerCommand::PauseInput { input: key.clone() }.planned(ctx("pause"), origin));
            }
            if prev.position != input.position {
                out.push(
                    MixerCommand::SetPosition {
                        input: key.clone(),
                        value: input.position,
                    }
                    .planned(ctx("seek"), origin),
                );
            }
            if prev.looping != input.looping {
                let command = if input.looping {
                    MixerCommand::LoopOn { input: key.clone() }
                } else {
                    MixerCommand::LoopOff { input: key.clone() }
                };
                out.push(command.planned(ctx("loop"), origin));
            }
            if prev.muted != input.muted && input.muted {
                out.push(MixerCommand::AudioOff { input: key.clone() }.planned(ctx("mute"), origin));
            }
            if prev.volume != input.volume {
                out.push(
                    MixerCommand::AudioVolume {
                        input: key.clone(),
                        value: input.volume,
                        fade: input.fade,
                    }
                    .planned(ctx("volume"), origin),
                );
            }
            if prev.balance != input.balance {
                out.push(
                    MixerCommand::AudioBalance {
                        input: key.clone(),
                        value: input.balance,
                    }
                    .planned(ctx("balance"), origin),
                );
            }
            if prev.muted != input.muted && !input.muted {
                out.push(MixerCommand::AudioOn { input: key.clone() }.planned(ctx("unmute"), origin));
            }

            let (a, b) = (&prev.transform, &input.transform);
            let transform = [
                (a.zoom != b.zoom).then(|| MixerCommand::SetZoom { input: key.clone(), value: b.zoom }),
                (a.alpha != b.alpha).then(|| MixerCommand::SetAlpha { input: key.clone(), value: b.alpha }),
                (a.pan_x != b.pan_x).then(|| MixerCommand::SetPanX { input: key.clone(), value: b.pan_x }),
                (a.pan_y != b.pan_y).then(|| MixerCommand::SetPanY { input: key.clone(), value: b.pan_y }),
            ];
            for command in transform.into_iter().flatten() {
                out.push(command.planned(ctx("transform"), origin));
            }

            if prev.playing != input.playing && input.playing {
                out.push(MixerCommand::PlayInput { input: key.clone() }.planned(ctx("play"), origin));
            }
        }
    }

    fn diff_mixes(old: &MixerState, new: &MixerState, out: &mut Vec<PlannedCommand>) {
        for (mix, (prev, next)) in old.mixes.iter().zip(&new.mixes).enumerate() {
            if let Some(program) = &next.program {
                if prev.program.as_ref() != Some(program) {
                    let origin = new.origin(&format!("mix:{mix}"));
                    out.push(PlannedCommand::pre_roll(
                        MixerCommand::PreviewInput {
                            input: program.clone(),
                            mix,
                        }
                        .with_context(format!("cue: {program} on mix {}", mix + 1), origin),
                        PRE_ROLL,
                        format!("preroll_mix{mix}"),
                    ));
                    out.push(
                        MixerCommand::Transition {
                            effect: next.transition.effect.clone(),
                            duration: next.transition.duration,
                            input: program.clone(),
                            mix,
                        }
                        .planned(format!("program: {program} on mix {}", mix + 1), origin),
                    );
                }
            }

            // Never touch preview while program changes; it could break the transition.
            if prev.program == next.program {
                if let Some(preview) = &next.preview {
                    if prev.preview.as_ref() != Some(preview) {
                        out.push(
                            MixerCommand::PreviewInput {
                                input: preview.clone(),
                                mix,
                            }
                            .planned(
                                format!("preview: {preview} on mix {}", mix + 1),
                                new.origin(&format!("preview:{mix}")),
                            ),
                        );
                    }
                }
            }
        }

        let main_unchanged = old.mixes.first().map(|m| &m.program) == new.mixes.first().map(|m| &m.program);
        if main_unchanged && old.fader_position != new.fader_position {
            out.push(
                MixerCommand::Fader {
                    value: new.fader_position,
                }
                .planned("fader", new.origin("fader")),
            );
        }
    }

    fn diff_toggles(old: &MixerState, new: &MixerState, out: &mut Vec<PlannedCommand>) {
        if old.fade_to_black != new.fade_to_black {
            // The device only toggles; it cannot be told on or off.
            out.push(MixerCommand::FadeToBlack.planned("fade to black", new.origin("fadeToBlack")));
        }

        for (i, (prev, next)) in old.overlays.iter().zip(&new.overlays).enumerate() {
            if prev == next {
                continue;
            }
            let number = i + 1;
            let origin = new.origin(&format!("overlay:{number}"));
            let command = match next {
                Some(input) => MixerCommand::OverlayInputIn {
                    input: input.clone(),
                    value: number,
                },
                None => MixerCommand::OverlayInputOut { value: number },
            };
            out.push(command.planned(format!("overlay {number}"), origin));
        }

        let toggles = [
            (old.recording, new.recording, MixerCommand::StartRecording, MixerCommand::StopRecording, "recording"),
            (old.streaming, new.streaming, MixerCommand::StartStreaming, MixerCommand::StopStreaming, "streaming"),
            (old.external, new.external, MixerCommand::StartExternal, MixerCommand::StopExternal, "external"),
        ];
        for (prev, next, start, stop, what) in toggles {
            if prev != next {
                let command = if next { start } else { stop };
                out.push(command.planned(what, new.origin(what)));
            }
        }
    }

    fn diff_outputs(old: &MixerState, new: &MixerState, out: &mut Vec<PlannedCommand>) {
        for (name, output) in &new.outputs {
            if old.outputs.get(name) == Some(output) {
                continue;
            }
            let value = if output.source == "Program" {
                "Output".to_string()
            } else {
                output.source.clone()
            };
            out.push(
                MixerCommand::SetOutput {
                    name: name.clone(),
                    value,
                    input: output.input.clone(),
                }
                .planned(format!("output {name}"), new.origin(&format!("output:{name}"))),
            );
        }
    }

    fn diff_removed_inputs(old: &MixerState, new: &MixerState, out: &mut Vec<PlannedCommand>) {
        for (key, input) in &old.inputs {
            if new.inputs.contains_key(key) || input.input_type.is_none() {
                continue;
            }
            out.push(
                MixerCommand::RemoveInput { input: key.clone() }
                .planned(format!("remove: input {key}"), old.origin(&format!("input:{key}"))),
            );
        }
    }
}

impl Reconciler for VideoMixerReconciler {
    type State = MixerState;

    fn send_mode(&self) -> SendMode {
        SendMode::InOrder
    }

    fn default_state(&self) -> MixerState {
        MixerState::default()
    }

    fn convert(&self, state: &TimelineState, mappings: &Mappings) -> MixerState {
        let mut layers: Vec<(&String, MixerMapping, MixerContent, &str)> = Vec::new();

        for (layer, obj) in &state.layers {
            let Some(mapping) = mappings
                .get(layer)
                .or_else(|| obj.original_layer.as_ref().and_then(|l| mappings.get(l)))
            else {
                continue;
            };
            let mapping = match serde_json::from_value::<MixerMapping>(Value::Object(mapping.options.clone())) {
                Ok(mapping) => mapping,
                Err(e) => {
                    tracing::warn!("Bad video mixer mapping for layer {}: {}", layer, e);
                    continue;
                }
            };
            let content = match serde_json::from_value::<MixerContent>(Value::Object(
                obj.content.attributes.clone(),
            )) {
                Ok(content) => content,
                Err(e) => {
                    tracing::warn!("Bad video mixer content on {}: {}", obj.id, e);
                    continue;
                }
            };
            layers.push((layer, mapping, content, obj.id.as_str()));
        }

        layers.sort_by(|a, b| (a.1.rank(), a.0).cmp(&(b.1.rank(), b.0)));

        let mut mixer = MixerState::default();
        for (_, mapping, content, obj_id) in layers {
            Self::apply(&mut mixer, &mapping, content, obj_id);
        }
        mixer
    }

    fn diff(&self, old: &MixerState, new: &MixerState) -> Vec<PlannedCommand> {
        let mut commands = Vec::new();
        Self::diff_inputs(old, new, &mut commands);
        Self::diff_mixes(old, new, &mut commands);
        Self::diff_toggles(old, new, &mut commands);
        Self::diff_outputs(old, new, &mut commands);
        Self::diff_removed_inputs(old, new, &mut commands);
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timeline::{Content, Mapping, ResolvedObject, ResolvedTimes};
    use crate::types::DeviceType;
    use serde_json::json;

    fn mapping(options: Value) -> Mapping {
        let mut m = Mapping::new(DeviceType::video_mixer(), "mixer0");
        if let Value::Object(options) = options {
            m.options = options;
        }
        m
    }

    fn layer_obj(id: &str, layer: &str, content: Value) -> ResolvedObject {
        let attributes = content.as_object().cloned().unwrap_or_default();
        ResolvedObject {
            id: id.into(),
            layer: layer.into(),
            original_layer: None,
            parent_id: None,
            is_group: false,
            priority: 0,
            content: Content {
                attributes,
                ..Content::default()
            },
            resolved: ResolvedTimes { start: 0, end: None },
        }
    }

    fn setup() -> Mappings {
        let mut mappings = Mappings::new();
        mappings.insert("program".into(), mapping(json!({"mappingType": "program", "index": 1})));
        mappings.insert("clip".into(), mapping(json!({"mappingType": "input", "index": "clip1"})));
        mappings.insert("rec".into(), mapping(json!({"mappingType": "recording"})));
        mappings.insert("out2".into(), mapping(json!({"mappingType": "output", "index": "2"})));
        mappings
    }

    fn commands(planned: &[PlannedCommand]) -> Vec<String> {
        planned
            .iter()
            .map(|p| p.command.command["command"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    fn full_state() -> TimelineState {
        let mut state = TimelineState::empty(5000);
        for obj in [
            layer_obj("cam", "program", json!({"type": "program", "input": "clip1", "transition": {"effect": "Fade", "duration": 500}})),
            layer_obj("clipObj", "clip", json!({"type": "input", "inputType": "Video", "filePath": "C:/media/clip1.mp4", "playing": true})),
            layer_obj("recObj", "rec", json!({"type": "recording", "on": true})),
            layer_obj("outObj", "out2", json!({"type": "output", "source": "Input", "input": 2})),
        ] {
            state.layers.insert(obj.layer.clone(), obj);
        }
        state
    }

    #[test]
    fn test_convert_builds_mixer_state() {
        let r = VideoMixerReconciler;
        let mixer = r.convert(&full_state(), &setup());

        assert_eq!(mixer.mixes[0].program.as_deref(), Some("clip1"));
        assert_eq!(mixer.mixes[0].transition.effect, "Fade");
        assert!(mixer.inputs["clip1"].playing);
        assert_eq!(mixer.inputs["clip1"].file_path.as_deref(), Some("C:/media/clip1.mp4"));
        assert!(mixer.recording);
        assert_eq!(mixer.outputs["2"].input.as_deref(), Some("2"));
        assert_eq!(mixer.origin("mix:0"), "cam");
    }

    #[test]
    fn test_diff_follows_category_order() {
        let r = VideoMixerReconciler;
        let new = r.convert(&full_state(), &setup());
        let planned = r.diff(&r.default_state(), &new);

        assert_eq!(
            commands(&planned),
            vec![
                "ADD_INPUT",
                "SET_INPUT_NAME",
                "PLAY_INPUT",
                "PREVIEW_INPUT",
                "TRANSITION",
                "START_RECORDING",
                "SET_OUTPUT",
            ]
        );
        assert_eq!(planned[0].command.command["value"], "Video|C:/media/clip1.mp4");
        assert_eq!(planned[1].command.command["input"], "clip1.mp4");
        assert_eq!(planned[1].command.command["value"], "clip1");
        assert_eq!(planned[2].command.command["input"], "clip1");

        let cue = &planned[3];
        assert_eq!(cue.lead, PRE_ROLL);
        assert_eq!(cue.token.as_deref(), Some("preroll_mix0"));
        assert_eq!(planned[4].lead, 0);
        assert_eq!(planned[4].command.timeline_obj_id, "cam");
    }

    #[test]
    fn test_unchanged_state_is_quiet() {
        let r = VideoMixerReconciler;
        let state = r.convert(&full_state(), &setup());
        assert!(r.diff(&state, &state).is_empty());
    }

    #[test]
    fn test_removed_input_comes_last() {
        let r = VideoMixerReconciler;
        let mappings = setup();
        let old = r.convert(&full_state(), &mappings);

        let mut next = full_state();
        next.layers.remove("clip");
        next.layers.remove("program");
        let new = r.convert(&next, &mappings);

        let planned = r.diff(&old, &new);
        assert_eq!(commands(&planned), vec!["REMOVE_INPUT"]);
        assert_eq!(planned[0].command.timeline_obj_id, "clipObj");
    }

    #[test]
    fn test_mismatched_content_is_ignored() {
        let r = VideoMixerReconciler;
        let mut state = TimelineState::empty(0);
        let obj = layer_obj("x", "rec", json!({"type": "streaming", "on": true}));
        state.layers.insert("rec".into(), obj);

        let mixer = r.convert(&state, &setup());
        assert!(!mixer.streaming);
        assert!(!mixer.recording);
        assert_eq!(r.send_mode(), SendMode::InOrder);
    }
}
