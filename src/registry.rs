//! Device registry.
//!
//! Maps a device-type tag to a factory producing a [`Device`]. New device
//! types register here without touching the conductor.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{CommandReceiver, LoggingReceiver};
use crate::devices::{
    AbstractReconciler, Device, DeviceContext, DeviceOptions, Reconciler, StatefulDevice,
    VideoMixerReconciler,
};
use crate::error::{ConductorError, ConductorResult};
use crate::types::DeviceType;

pub type DeviceFactory =
    Arc<dyn Fn(DeviceContext, &DeviceOptions) -> Result<Box<dyn Device>> + Send + Sync>;

/// Registry of device factories.
#[derive(Clone)]
pub struct DeviceRegistry {
    factories: HashMap<DeviceType, DeviceFactory>,
}

impl DeviceRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the bundled `abstract` and `videomixer` devices.
    pub fn with_defaults() -> Self {
        Self::new()
            .register_reconciler(DeviceType::abstract_device(), AbstractReconciler)
            .register_reconciler(DeviceType::video_mixer(), VideoMixerReconciler)
    }

    /// Register a factory for a device type, replacing any previous one.
    pub fn register<F>(mut self, device_type: DeviceType, factory: F) -> Self
    where
        F: Fn(DeviceContext, &DeviceOptions) -> Result<Box<dyn Device>> + Send + Sync + 'static,
    {
        self.factories.insert(device_type, Arc::new(factory));
        self
    }

    /// Register a state-diffing device built around `reconciler`.
    pub fn register_reconciler<R>(self, device_type: DeviceType, reconciler: R) -> Self
    where
        R: Reconciler + Clone + Sync,
    {
        self.register(device_type, move |ctx, options| {
            let receiver: Arc<dyn CommandReceiver> = match &options.command_receiver {
                Some(receiver) => receiver.clone(),
                None => Arc::new(LoggingReceiver::new(ctx.device_id.clone())),
            };
            let device = StatefulDevice::new(ctx, reconciler.clone(), receiver, options.timecode_fps);
            Ok(Box::new(device) as Box<dyn Device>)
        })
    }

    /// Build a device of `options.device_type`.
    pub fn create(
        &self,
        ctx: DeviceContext,
        options: &DeviceOptions,
    ) -> ConductorResult<Box<dyn Device>> {
        let factory = self
            .factories
            .get(&options.device_type)
            .ok_or_else(|| ConductorError::UnknownDeviceType(options.device_type.clone()))?;
        factory(ctx, options).map_err(|e| ConductorError::Config(e.to_string()))
    }

    pub fn contains(&self, device_type: &DeviceType) -> bool {
        self.factories.contains_key(device_type)
    }

    /// List all registered device types.
    pub fn list_types(&self) -> Vec<DeviceType> {
        let mut types: Vec<_> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::types::DeviceId;
    use tokio::sync::mpsc;

    fn ctx(device_type: DeviceType) -> DeviceContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        DeviceContext::new(DeviceId::new("dev0"), device_type, Clock::starting_at(0), false, tx)
    }

    #[test]
    fn test_defaults_are_registered() {
        let registry = DeviceRegistry::with_defaults();
        assert_eq!(
            registry.list_types(),
            vec![DeviceType::abstract_device(), DeviceType::video_mixer()]
        );
        assert!(!DeviceRegistry::new().contains(&DeviceType::abstract_device()));
    }

    #[tokio::test]
    async fn test_create_known_and_unknown() {
        let registry = DeviceRegistry::with_defaults();

        let device = registry
            .create(
                ctx(DeviceType::abstract_device()),
                &DeviceOptions::new(DeviceType::abstract_device()),
            )
            .unwrap();
        assert_eq!(device.device_id().as_str(), "dev0");

        let err = registry
            .create(
                ctx(DeviceType::new("casparcg")),
                &DeviceOptions::new(DeviceType::new("casparcg")),
            )
            .err()
            .unwrap();
        assert!(matches!(err, ConductorError::UnknownDeviceType(t) if t.as_str() == "casparcg"));
    }

    #[test]
    fn test_factory_errors_become_config_errors() {
        let registry = DeviceRegistry::new().register(DeviceType::new("broken"), |_, _| {
            anyhow::bail!("missing host")
        });
        let err = registry
            .create(ctx(DeviceType::new("broken")), &DeviceOptions::new(DeviceType::new("broken")))
            .err()
            .unwrap();
        assert!(matches!(err, ConductorError::Config(m) if m == "missing host"));
    }
}
