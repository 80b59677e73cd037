//! Actor wrapper giving each device its own task.
//!
//! Requests travel over a channel and are answered through oneshot replies.
//! A device that panics takes only its own task down; afterwards every call
//! fails with [`ConductorError::DeviceStopped`].

use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use tokio::sync::{mpsc, oneshot};

use super::{Device, DeviceStatus};
use crate::core::QueueEntry;
use crate::error::{ConductorError, ConductorResult};
use crate::timeline::{Mappings, TimelineState};
use crate::types::{DeviceId, DeviceType, Time};

const REQUEST_BUFFER: usize = 64;

type Reply<T> = oneshot::Sender<T>;

enum DeviceRequest {
    Init(Value, Reply<anyhow::Result<bool>>),
    SetMapping(Mappings, Reply<()>),
    PrepareForHandleState(Time, Reply<()>),
    HandleState(Box<TimelineState>, Mappings, Reply<anyhow::Result<()>>),
    ClearFuture(Time, Reply<()>),
    MakeReady(bool, Reply<anyhow::Result<()>>),
    StandDown(bool, Reply<anyhow::Result<()>>),
    Terminate(Reply<anyhow::Result<bool>>),
    Queue(Reply<Vec<QueueEntry>>),
    Status(Reply<DeviceStatus>),
}

/// Handle to a device running in its own task.
#[derive(Clone)]
pub struct DeviceContainer {
    device_id: DeviceId,
    device_type: DeviceType,
    sender: mpsc::Sender<DeviceRequest>,
}

impl DeviceContainer {
    pub fn spawn(device: Box<dyn Device>) -> Self {
        let device_id = device.device_id().clone();
        let device_type = device.device_type().clone();
        let (sender, receiver) = mpsc::channel(REQUEST_BUFFER);

        tokio::spawn(run(device, receiver));

        Self {
            device_id,
            device_type,
            sender,
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn device_type(&self) -> &DeviceType {
        &self.device_type
    }

    async fn call<T>(&self, request: impl FnOnce(Reply<T>) -> DeviceRequest) -> ConductorResult<T> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(request(reply))
            .await
            .map_err(|_| ConductorError::DeviceStopped(self.device_id.clone()))?;
        response
            .await
            .map_err(|_| ConductorError::DeviceStopped(self.device_id.clone()))
    }

    fn dispatch<T>(&self, result: anyhow::Result<T>) -> ConductorResult<T> {
        result.map_err(|e| ConductorError::dispatch(&self.device_id, e))
    }

    pub async fn init(&self, options: Value) -> ConductorResult<bool> {
        let result = self.call(|r| DeviceRequest::Init(options, r)).await?;
        self.dispatch(result)
    }

    pub async fn set_mapping(&self, mappings: Mappings) -> ConductorResult<()> {
        self.call(|r| DeviceRequest::SetMapping(mappings, r)).await
    }

    pub async fn prepare_for_handle_state(&self, time: Time) -> ConductorResult<()> {
        self.call(|r| DeviceRequest::PrepareForHandleState(time, r))
            .await
    }

    pub async fn handle_state(
        &self,
        state: TimelineState,
        mappings: Mappings,
    ) -> ConductorResult<()> {
        let result = self
            .call(|r| DeviceRequest::HandleState(Box::new(state), mappings, r))
            .await?;
        self.dispatch(result)
    }

    pub async fn clear_future(&self, time: Time) -> ConductorResult<()> {
        self.call(|r| DeviceRequest::ClearFuture(time, r)).await
    }

    pub async fn make_ready(&self, ok_to_destroy: bool) -> ConductorResult<()> {
        let result = self
            .call(|r| DeviceRequest::MakeReady(ok_to_destroy, r))
            .await?;
        self.dispatch(result)
    }

    pub async fn stand_down(&self, ok_to_destroy: bool) -> ConductorResult<()> {
        let result = self
            .call(|r| DeviceRequest::StandDown(ok_to_destroy, r))
            .await?;
        self.dispatch(result)
    }

    /// Stop the device. The task exits after replying.
    pub async fn terminate(&self) -> ConductorResult<bool> {
        let result = self.call(DeviceRequest::Terminate).await?;
        self.dispatch(result)
    }

    pub async fn queue(&self) -> ConductorResult<Vec<QueueEntry>> {
        self.call(DeviceRequest::Queue).await
    }

    pub async fn status(&self) -> ConductorResult<DeviceStatus> {
        self.call(DeviceRequest::Status).await
    }
}

async fn run(mut device: Box<dyn Device>, mut receiver: mpsc::Receiver<DeviceRequest>) {
    let device_id = device.device_id().clone();

    while let Some(request) = receiver.recv().await {
        let outcome = AssertUnwindSafe(serve(device.as_mut(), request))
            .catch_unwind()
            .await;
        match outcome {
            Ok(true) => continue,
            Ok(false) => break,
            Err(_) => {
                tracing::error!("Device {} panicked; stopping it", device_id);
                break;
            }
        }
    }

    tracing::debug!("Device {} task finished", device_id);
}

/// Serve one request. Returns false once the device has terminated.
async fn serve(device: &mut dyn Device, request: DeviceRequest) -> bool {
    match request {
        DeviceRequest::Init(options, reply) => {
            let _ = reply.send(device.init(&options).await);
        }
        DeviceRequest::SetMapping(mappings, reply) => {
            device.set_mapping(mappings);
            let _ = reply.send(());
        }
        DeviceRequest::PrepareForHandleState(time, reply) => {
            device.prepare_for_handle_state(time);
            let _ = reply.send(());
        }
        DeviceRequest::HandleState(state, mappings, reply) => {
            let _ = reply.send(device.handle_state(*state, &mappings).await);
        }
        DeviceRequest::ClearFuture(time, reply) => {
            device.clear_future(time);
            let _ = reply.send(());
        }
        DeviceRequest::MakeReady(ok_to_destroy, reply) => {
            let _ = reply.send(device.make_ready(ok_to_destroy).await);
        }
        DeviceRequest::StandDown(ok_to_destroy, reply) => {
            let _ = reply.send(device.stand_down(ok_to_destroy).await);
        }
        DeviceRequest::Terminate(reply) => {
            let _ = reply.send(device.terminate().await);
            return false;
        }
        DeviceRequest::Queue(reply) => {
            let _ = reply.send(device.queue());
        }
        DeviceRequest::Status(reply) => {
            let _ = reply.send(device.status());
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Flaky {
        id: DeviceId,
        ty: DeviceType,
    }

    #[async_trait]
    impl Device for Flaky {
        fn device_id(&self) -> &DeviceId {
            &self.id
        }

        fn device_type(&self) -> &DeviceType {
            &self.ty
        }

        async fn init(&mut self, _options: &Value) -> anyhow::Result<bool> {
            Ok(true)
        }

        fn set_mapping(&mut self, _mappings: Mappings) {}

        fn prepare_for_handle_state(&mut self, _time: Time) {}

        async fn handle_state(
            &mut self,
            state: TimelineState,
            _mappings: &Mappings,
        ) -> anyhow::Result<()> {
            if state.time < 0 {
                panic!("negative time");
            }
            anyhow::ensure!(state.time != 13, "unlucky");
            Ok(())
        }

        fn clear_future(&mut self, _time: Time) {}

        async fn make_ready(&mut self, _ok_to_destroy: bool) -> anyhow::Result<()> {
            Ok(())
        }

        async fn stand_down(&mut self, _ok_to_destroy: bool) -> anyhow::Result<()> {
            Ok(())
        }

        async fn terminate(&mut self) -> anyhow::Result<bool> {
            Ok(true)
        }

        fn queue(&self) -> Vec<QueueEntry> {
            Vec::new()
        }

        fn status(&self) -> DeviceStatus {
            DeviceStatus::good()
        }
    }

    fn spawn_flaky() -> DeviceContainer {
        DeviceContainer::spawn(Box::new(Flaky {
            id: DeviceId::new("flaky"),
            ty: DeviceType::abstract_device(),
        }))
    }

    #[tokio::test]
    async fn test_device_error_becomes_dispatch_error() {
        let container = spawn_flaky();
        assert!(container.init(Value::Null).await.unwrap());

        let err = container
            .handle_state(TimelineState::empty(13), Mappings::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::DeviceDispatch { ref message, .. } if message == "unlucky"));

        // still alive
        container
            .handle_state(TimelineState::empty(14), Mappings::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_panic_stops_only_that_device() {
        let container = spawn_flaky();
        let err = container
            .handle_state(TimelineState::empty(-1), Mappings::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::DeviceStopped(_)));
        assert!(matches!(
            container.status().await,
            Err(ConductorError::DeviceStopped(_))
        ));

        let other = spawn_flaky();
        assert!(other.status().await.unwrap().active);
    }

    #[tokio::test]
    async fn test_terminate_ends_task() {
        let container = spawn_flaky();
        assert!(container.terminate().await.unwrap());
        assert!(container.queue().await.is_err());
    }
}
