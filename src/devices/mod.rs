//! Device collaborator interface.
//!
//! The conductor never talks to a device directly: each device runs inside a
//! [`container::DeviceContainer`] actor and reports back through
//! [`DeviceEvent`]s on the channel handed to it in its [`DeviceContext`].

pub mod abstract_device;
pub mod container;
pub mod state;
pub mod video_mixer;

pub use abstract_device::AbstractReconciler;
pub use container::DeviceContainer;
pub use state::{PlannedCommand, Reconciler, StateHistory, StatefulDevice};
pub use video_mixer::VideoMixerReconciler;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::core::{CommandReceiver, QueueEntry};
use crate::timeline::{Mappings, TimelineState};
use crate::types::{DeviceId, DeviceType, Time};

/// Capability interface every connected device implements.
///
/// The container owns the device exclusively, so methods take `&mut self`.
#[async_trait]
pub trait Device: Send {
    fn device_id(&self) -> &DeviceId;

    fn device_type(&self) -> &DeviceType;

    /// Connect and prime the device. Returns whether it is ready.
    async fn init(&mut self, options: &Value) -> Result<bool>;

    /// The layer routing currently in effect.
    fn set_mapping(&mut self, mappings: Mappings);

    /// Drop queued commands and achieved states after `time`.
    fn prepare_for_handle_state(&mut self, time: Time);

    /// Converge the device towards `state`, scheduling commands as needed.
    async fn handle_state(&mut self, state: TimelineState, mappings: &Mappings) -> Result<()>;

    /// Cancel scheduled-but-unfired commands targeted after `time`.
    fn clear_future(&mut self, time: Time);

    async fn make_ready(&mut self, ok_to_destroy: bool) -> Result<()>;

    async fn stand_down(&mut self, ok_to_destroy: bool) -> Result<()>;

    async fn terminate(&mut self) -> Result<bool>;

    fn queue(&self) -> Vec<QueueEntry>;

    fn status(&self) -> DeviceStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StatusCode {
    #[default]
    Unknown,
    Good,
    Bad,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub status_code: StatusCode,
    #[serde(default)]
    pub messages: Vec<String>,
    pub active: bool,
}

impl DeviceStatus {
    pub fn good() -> Self {
        Self {
            status_code: StatusCode::Good,
            messages: Vec::new(),
            active: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEventKind {
    Debug(String),
    Info(String),
    Warning(String),
    Error { context: String, message: String },
    /// The device wants the conductor to resolve again.
    ResetResolver,
    SlowCommand(String),
    ConnectionChanged(DeviceStatus),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub device_id: DeviceId,
    pub kind: DeviceEventKind,
}

/// Everything a device factory gets from the conductor.
#[derive(Clone)]
pub struct DeviceContext {
    pub device_id: DeviceId,
    pub device_type: DeviceType,
    pub clock: Clock,
    pub initialize_as_clear: bool,
    events: mpsc::UnboundedSender<DeviceEvent>,
}

impl DeviceContext {
    pub fn new(
        device_id: DeviceId,
        device_type: DeviceType,
        clock: Clock,
        initialize_as_clear: bool,
        events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Self {
        Self {
            device_id,
            device_type,
            clock,
            initialize_as_clear,
            events,
        }
    }

    /// Report an event to the conductor. Dropped if the conductor is gone.
    pub fn emit(&self, kind: DeviceEventKind) {
        let _ = self.events.send(DeviceEvent {
            device_id: self.device_id.clone(),
            kind,
        });
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device_id", &self.device_id)
            .field("device_type", &self.device_type)
            .field("initialize_as_clear", &self.initialize_as_clear)
            .finish()
    }
}

/// Options for adding a device.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOptions {
    #[serde(rename = "type")]
    pub device_type: DeviceType,
    /// Device-specific connection options, passed to `init`.
    #[serde(default)]
    pub options: Value,
    /// Annotate commands with a `HH:MM:SS:FF` timecode at this frame rate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timecode_fps: Option<u32>,
    /// Transport override; commands are only logged when absent.
    #[serde(skip)]
    pub command_receiver: Option<Arc<dyn CommandReceiver>>,
}

impl DeviceOptions {
    pub fn new(device_type: DeviceType) -> Self {
        Self {
            device_type,
            options: Value::Null,
            timecode_fps: None,
            command_receiver: None,
        }
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_receiver(mut self, receiver: Arc<dyn CommandReceiver>) -> Self {
        self.command_receiver = Some(receiver);
        self
    }

    pub fn with_timecode(mut self, fps: u32) -> Self {
        self.timecode_fps = Some(fps);
        self
    }
}

impl fmt::Debug for DeviceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceOptions")
            .field("device_type", &self.device_type)
            .field("options", &self.options)
            .field("timecode_fps", &self.timecode_fps)
            .field("command_receiver", &self.command_receiver.is_some())
            .finish()
    }
}
