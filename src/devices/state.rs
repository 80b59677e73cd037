//! Generic state-diff-and-schedule device.
//!
//! A [`Reconciler`] knows how one kind of device looks: how to turn a timeline
//! substate into a device state and how to diff two device states into
//! commands. [`StatefulDevice`] does the rest: achieved-state history,
//! scheduling, pre-roll and catch-up.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use super::{Device, DeviceContext, DeviceEventKind, DeviceStatus};
use crate::clock::{TimeTranslation, TimecodeTranslation};
use crate::core::{CommandReceiver, CommandWithContext, DoOnTime, QueueEntry, SchedulerEvent, SendMode};
use crate::timeline::{Mappings, TimelineState};
use crate::types::{DeviceId, DeviceType, Time};

/// States older than this (relative to now) are pruned.
pub const STATE_RETENTION: Time = 60_000;

/// Every this many `set_state` calls the history is pruned.
const PRUNE_EVERY: u32 = 10;

/// Time-indexed history of achieved device states.
#[derive(Debug, Clone)]
pub struct StateHistory<S> {
    states: BTreeMap<Time, S>,
    set_count: u32,
}

impl<S> Default for StateHistory<S> {
    fn default() -> Self {
        Self {
            states: BTreeMap::new(),
            set_count: 0,
        }
    }
}

impl<S> StateHistory<S> {
    /// Latest state stored strictly before `time`.
    pub fn get_state_before(&self, time: Time) -> Option<(Time, &S)> {
        self.states.range(..time).next_back().map(|(t, s)| (*t, s))
    }

    pub fn set_state(&mut self, state: S, time: Time, now: Time) {
        self.states.insert(time, state);
        self.set_count += 1;
        if self.set_count % PRUNE_EVERY == 0 {
            self.prune_before(now - STATE_RETENTION);
        }
    }

    /// Drop states older than `time`, keeping the newest of them.
    pub fn prune_before(&mut self, time: Time) {
        let Some(keep) = self.states.range(..time).next_back().map(|(t, _)| *t) else {
            return;
        };
        self.states.retain(|t, _| *t >= keep);
    }

    /// Drop states later than `time`.
    pub fn remove_after(&mut self, time: Time) {
        self.states.retain(|t, _| *t <= time);
    }

    pub fn clear(&mut self) {
        self.states.clear();
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

/// A command produced by a diff.
///
/// `lead` > 0 marks a pre-roll: it should go out `lead` before the state's
/// time and is skipped when that is no longer possible.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedCommand {
    pub command: CommandWithContext,
    pub lead: Time,
    pub token: Option<String>,
}

impl PlannedCommand {
    pub fn at_state(command: CommandWithContext) -> Self {
        Self {
            command,
            lead: 0,
            token: None,
        }
    }

    pub fn pre_roll(command: CommandWithContext, lead: Time, token: impl Into<String>) -> Self {
        Self {
            command,
            lead,
            token: Some(token.into()),
        }
    }
}

/// Device-type specific conversion and diffing.
pub trait Reconciler: Send + 'static {
    type State: Clone + PartialEq + Debug + Send + 'static;

    fn send_mode(&self) -> SendMode;

    /// The blank state a freshly cleared device is in.
    fn default_state(&self) -> Self::State;

    fn convert(&self, state: &TimelineState, mappings: &Mappings) -> Self::State;

    /// Ordered commands taking a device from `old` to `new`.
    fn diff(&self, old: &Self::State, new: &Self::State) -> Vec<PlannedCommand>;
}

pub struct StatefulDevice<R: Reconciler> {
    ctx: DeviceContext,
    reconciler: R,
    history: StateHistory<R::State>,
    queue: DoOnTime,
    receiver: Arc<dyn CommandReceiver>,
    timecode_fps: Option<u32>,
    translation: Option<Box<dyn TimeTranslation>>,
    status: DeviceStatus,
    mappings: Mappings,
}

impl<R: Reconciler> StatefulDevice<R> {
    pub fn new(
        ctx: DeviceContext,
        reconciler: R,
        receiver: Arc<dyn CommandReceiver>,
        timecode_fps: Option<u32>,
    ) -> Self {
        let queue = DoOnTime::new(ctx.clock.clone(), reconciler.send_mode());
        let events = ctx.clone();
        queue.set_event_sink(Arc::new(move |event| match event {
            SchedulerEvent::Error { context, message } => {
                events.emit(DeviceEventKind::Error { context, message })
            }
            SchedulerEvent::SlowCommand {
                context,
                target_time,
                started_at,
            } => events.emit(DeviceEventKind::SlowCommand(format!(
                "{context} started {}ms after {target_time}",
                started_at - target_time
            ))),
        }));

        Self {
            ctx,
            reconciler,
            history: StateHistory::default(),
            queue,
            receiver,
            timecode_fps,
            translation: None,
            status: DeviceStatus::default(),
            mappings: Mappings::new(),
        }
    }

    pub fn reconciler(&self) -> &R {
        &self.reconciler
    }

    pub fn history(&self) -> &StateHistory<R::State> {
        &self.history
    }

    pub fn mappings(&self) -> &Mappings {
        &self.mappings
    }

    fn add_to_queue(&self, commands: Vec<PlannedCommand>, time: Time, old_time: Option<Time>) {
        let now = self.ctx.clock.now();

        for planned in commands {
            let target = if planned.lead > 0 {
                match old_time {
                    Some(old_time) if time > now => (time - planned.lead).max(old_time).max(now),
                    _ => continue,
                }
            } else {
                // Past targets fire on the next tick.
                time
            };

            let mut command = planned.command;
            command.device_time = self
                .translation
                .as_ref()
                .map(|t| t.to_device_time(target));

            let receiver = self.receiver.clone();
            self.queue.queue(
                target,
                planned.token.as_deref(),
                command.context.clone(),
                move || async move { receiver.send(target, command).await },
            );
        }
    }
}

#[async_trait]
impl<R: Reconciler> Device for StatefulDevice<R> {
    fn device_id(&self) -> &DeviceId {
        &self.ctx.device_id
    }

    fn device_type(&self) -> &DeviceType {
        &self.ctx.device_type
    }

    async fn init(&mut self, _options: &Value) -> Result<bool> {
        let now = self.ctx.clock.now();
        if self.ctx.initialize_as_clear {
            self.history
                .set_state(self.reconciler.default_state(), now, now);
        }
        if let Some(fps) = self.timecode_fps {
            self.translation = Some(Box::new(TimecodeTranslation::time_of_day(now, fps)));
        }
        self.status = DeviceStatus::good();
        self.ctx
            .emit(DeviceEventKind::ConnectionChanged(self.status.clone()));
        Ok(true)
    }

    fn set_mapping(&mut self, mappings: Mappings) {
        self.mappings = mappings;
    }

    fn prepare_for_handle_state(&mut self, time: Time) {
        self.queue.clear_queue_after(time);
        self.history.remove_after(time);
    }

    async fn handle_state(&mut self, state: TimelineState, mappings: &Mappings) -> Result<()> {
        let time = state.time;
        let now = self.ctx.clock.now();
        let previous_time = (now + 1).max(time);

        let (old, old_time) = match self.history.get_state_before(previous_time) {
            Some((t, s)) => (s.clone(), Some(t)),
            None => (self.reconciler.default_state(), None),
        };

        let new = self.reconciler.convert(&state, mappings);
        let commands = self.reconciler.diff(&old, &new);
        if !commands.is_empty() {
            self.ctx.emit(DeviceEventKind::Debug(format!(
                "{} commands for state at {}",
                commands.len(),
                time
            )));
        }

        self.queue.clear_queue_now_and_after(previous_time);
        self.add_to_queue(commands, time, old_time);
        self.history.set_state(new, time, now);
        Ok(())
    }

    fn clear_future(&mut self, time: Time) {
        self.queue.clear_queue_after(time);
    }

    async fn make_ready(&mut self, ok_to_destroy: bool) -> Result<()> {
        if ok_to_destroy {
            let now = self.ctx.clock.now();
            self.queue.clear_queue_now_and_after(Time::MIN);
            self.history.clear();
            self.history
                .set_state(self.reconciler.default_state(), now, now);
            self.ctx.emit(DeviceEventKind::ResetResolver);
        }
        Ok(())
    }

    async fn stand_down(&mut self, _ok_to_destroy: bool) -> Result<()> {
        Ok(())
    }

    async fn terminate(&mut self) -> Result<bool> {
        self.queue.dispose();
        self.status.active = false;
        Ok(true)
    }

    fn queue(&self) -> Vec<QueueEntry> {
        self.queue.get_queue()
    }

    fn status(&self) -> DeviceStatus {
        self.status.clone()
    }
}
