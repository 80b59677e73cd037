// Command transport seam

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::types::{DeviceId, Time};

/// A device command plus the diagnostics that travel with it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandWithContext {
    pub command: Value,
    /// Human readable reason, e.g. `added: intro`.
    pub context: String,
    pub timeline_obj_id: String,
    /// On-device address of the target time, when the device translates time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_time: Option<String>,
}

impl CommandWithContext {
    pub fn new(command: Value, context: impl Into<String>, timeline_obj_id: impl Into<String>) -> Self {
        Self {
            command,
            context: context.into(),
            timeline_obj_id: timeline_obj_id.into(),
            device_time: None,
        }
    }
}

/// Sends a command over the device's transport.
///
/// Concrete wire protocols live behind this trait; the reconcilers only
/// decide what to send and when.
#[async_trait]
pub trait CommandReceiver: Send + Sync {
    async fn send(&self, time: Time, command: CommandWithContext) -> Result<()>;
}

/// Receiver that only logs what it would have sent.
pub struct LoggingReceiver {
    device_id: DeviceId,
}

impl LoggingReceiver {
    pub fn new(device_id: DeviceId) -> Self {
        Self { device_id }
    }
}

#[async_trait]
impl CommandReceiver for LoggingReceiver {
    async fn send(&self, time: Time, command: CommandWithContext) -> Result<()> {
        tracing::info!(
            device = %self.device_id,
            time,
            context = %command.context,
            command = %command.command,
            "Sending command"
        );
        Ok(())
    }
}

/// Receiver that records every command with the time it was sent.
#[derive(Clone, Default)]
pub struct CommandLog {
    entries: Arc<Mutex<Vec<(Time, CommandWithContext)>>>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(Time, CommandWithContext)> {
        self.entries.lock().clone()
    }

    pub fn contexts(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|(_, c)| c.context.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[async_trait]
impl CommandReceiver for CommandLog {
    async fn send(&self, time: Time, command: CommandWithContext) -> Result<()> {
        self.entries.lock().push((time, command));
        Ok(())
    }
}
