//! Conductor options and show file loading.

use serde::Deserialize;
use serde_json::Value;
use std::{collections::BTreeMap, env, fs, path::Path, path::PathBuf};

use crate::clock::Clock;
use crate::devices::DeviceOptions;
use crate::error::{ConductorError, ConductorResult};
use crate::timeline::{Mappings, TimelineObject};
use crate::types::{DeviceId, Time};

/// Tunables of the resolve loop.
#[derive(Debug, Clone)]
pub struct ConductorOptions {
    /// Devices start from their blank state instead of an unknown one.
    pub initialize_as_clear: bool,
    pub get_current_time: Clock,
    /// Run `init` from the constructor.
    pub auto_init: bool,
    /// Horizon beyond which resolving is deferred.
    pub lookahead: Time,
    /// How long before an event the wake timer fires.
    pub prepare_time: Time,
    pub min_trigger_time: Time,
    pub safety_tick: Time,
    /// Window over which start/stop callbacks are collected.
    pub callback_batch: Time,
    pub callback_debounce: Time,
    pub event_capacity: usize,
    pub log_debug: bool,
}

impl Default for ConductorOptions {
    fn default() -> Self {
        Self {
            initialize_as_clear: false,
            get_current_time: Clock::default(),
            auto_init: false,
            lookahead: 5000,
            prepare_time: 2000,
            min_trigger_time: 10,
            safety_tick: 2500,
            callback_batch: 100,
            callback_debounce: 50,
            event_capacity: 1024,
            log_debug: false,
        }
    }
}

impl ConductorOptions {
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.get_current_time = clock;
        self
    }

    pub fn initialize_as_clear(mut self, clear: bool) -> Self {
        self.initialize_as_clear = clear;
        self
    }
}

/// A show file: devices, mappings and the timeline to play.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShowConfig {
    #[serde(default)]
    pub devices: BTreeMap<DeviceId, DeviceOptions>,
    #[serde(default)]
    pub mappings: Mappings,
    #[serde(default)]
    pub timeline: Vec<TimelineObject>,
}

pub fn resolve_show_path() -> ConductorResult<PathBuf> {
    if let Ok(p) = env::var("CONDUCTOR_SHOW") {
        return Ok(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("playout-conductor").join("show.json");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let candidate = PathBuf::from("show.json");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(ConductorError::Config(
        "Could not find show.json (set CONDUCTOR_SHOW or create ./show.json)".to_string(),
    ))
}

/// Replace `${VAR}` with the environment value; unknown variables stay verbatim.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) => out.push_str(&val),
                Err(_) => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_value(value: &mut Value) {
    match value {
        Value::String(s) => *s = expand_env_vars(s),
        Value::Array(items) => items.iter_mut().for_each(expand_value),
        Value::Object(map) => map.values_mut().for_each(expand_value),
        _ => {}
    }
}

pub fn load_show_from(path: &Path) -> ConductorResult<ShowConfig> {
    let raw = fs::read_to_string(path)
        .map_err(|e| ConductorError::Config(format!("{}: {}", path.display(), e)))?;
    let mut show: ShowConfig = serde_json::from_str(&raw)
        .map_err(|e| ConductorError::Config(format!("{}: {}", path.display(), e)))?;

    for device in show.devices.values_mut() {
        expand_value(&mut device.options);
    }

    Ok(show)
}

pub fn load_show() -> ConductorResult<ShowConfig> {
    let path = resolve_show_path()?;
    tracing::info!("Loading show from {}", path.display());
    load_show_from(&path)
}
