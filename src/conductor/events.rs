//! Events published by the conductor.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use super::now::TriggerTimeFix;
use crate::types::{DeviceId, Time};

/// Timings of one resolve pass, relative to when the triggering change arrived.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatReport {
    pub reason: String,
    pub timeline_resolved: Time,
    pub state_handled: Time,
    pub done: Time,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ConductorEvent {
    Error {
        message: String,
    },
    Warning {
        message: String,
    },
    Info {
        message: String,
    },
    Debug {
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    TimelineCallback {
        time: Time,
        object_id: String,
        callback: String,
        data: Option<Value>,
    },
    /// "now" triggers that were rewritten to concrete times.
    SetTimelineTriggerTime {
        fixes: Vec<TriggerTimeFix>,
    },
    #[serde(rename_all = "camelCase")]
    SlowCommand {
        device_id: DeviceId,
        message: String,
    },
    StatReport(StatReport),
}

/// Broadcast fan-out of [`ConductorEvent`]s, mirrored to tracing.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: broadcast::Sender<ConductorEvent>,
}

impl EventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConductorEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ConductorEvent) {
        match &event {
            ConductorEvent::Error { message } => tracing::error!("{}", message),
            ConductorEvent::Warning { message } => tracing::warn!("{}", message),
            ConductorEvent::Info { message } => tracing::info!("{}", message),
            ConductorEvent::Debug { message } => tracing::debug!("{}", message),
            ConductorEvent::TimelineCallback {
                time,
                object_id,
                callback,
                ..
            } => tracing::debug!("Callback {} for {} at {}", callback, object_id, time),
            ConductorEvent::SetTimelineTriggerTime { fixes } => {
                tracing::debug!("Fixed {} \"now\" trigger(s)", fixes.len())
            }
            ConductorEvent::SlowCommand { device_id, message } => {
                tracing::warn!("{}: {}", device_id, message)
            }
            ConductorEvent::StatReport(report) => tracing::debug!(
                "Stat report ({}): resolved {}ms, handled {}ms, done {}ms",
                report.reason,
                report.timeline_resolved,
                report.state_handled,
                report.done
            ),
        }
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(ConductorEvent::Error {
            message: message.into(),
        });
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(ConductorEvent::Warning {
            message: message.into(),
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(ConductorEvent::Info {
            message: message.into(),
        });
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(ConductorEvent::Debug {
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let sink = EventSink::new(8);
        let mut rx = sink.subscribe();

        sink.warning("careful");
        sink.emit(ConductorEvent::StatReport(StatReport {
            reason: "timeline received".into(),
            timeline_resolved: 1,
            state_handled: 2,
            done: 3,
        }));

        assert_eq!(
            rx.recv().await.unwrap(),
            ConductorEvent::Warning {
                message: "careful".into()
            }
        );
        assert!(matches!(rx.recv().await.unwrap(), ConductorEvent::StatReport(r) if r.done == 3));
    }

    #[test]
    fn test_emit_without_subscribers() {
        EventSink::new(1).info("nobody listens");
    }

    #[test]
    fn test_event_serialization() {
        let event = ConductorEvent::TimelineCallback {
            time: 1000,
            object_id: "A".into(),
            callback: "playing".into(),
            data: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "timelineCallback");
        assert_eq!(json["objectId"], "A");
    }
}
