//! The conductor: owns the timeline, resolves it ahead of time and hands each
//! device its slice of the resulting state.
//!
//! Resolving happens in passes. A pass resolves the state at the next
//! interesting time (or now), fans it out to every device, then arms a timer
//! shortly before the following event. A safety tick re-runs the pass
//! periodically so a missed wake-up cannot stall playout.

pub mod callbacks;
pub mod events;
pub mod now;


pub use callbacks::{CallbackKind, CallbackRecord, QueuedCallback, debounce_callbacks, plan_callbacks};
pub use events::{ConductorEvent, EventSink, StatReport};
pub use now::{NowFixation, TriggerTimeFix, fix_now_objects};

use futures::FutureExt;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::clock::{Clock, millis};
use crate::config::ConductorOptions;
use crate::core::{DoOnTime, SendMode};
use crate::devices::{DeviceContainer, DeviceContext, DeviceEvent, DeviceEventKind, DeviceOptions};
use crate::error::{ConductorError, ConductorResult};
use crate::registry::DeviceRegistry;
use crate::timeline::{BasicResolver, Mappings, TimelineObject, TimelineResolver, TimelineState};
use crate::types::{DeviceId, Time};

/// Smallest step between two resolve times.
pub const MIN_TIME_UNIT: Time = 1;

/// Stat reports kept for `stat_reports`.
const STAT_HISTORY: usize = 100;

#[derive(Default)]
struct Gate {
    running: bool,
    queued: bool,
}

#[derive(Default)]
struct NextResolve {
    time: Option<Time>,
    /// Bumped by every reset so a pass started before it cannot overwrite it.
    generation: u64,
}

#[derive(Default)]
struct Document {
    timeline: Vec<TimelineObject>,
    mappings: Mappings,
}

#[derive(Clone)]
struct Measure {
    started: Instant,
    reason: String,
}

#[derive(Default)]
struct Stats {
    measure: Option<Measure>,
    reports: Vec<StatReport>,
}

struct CallbackTracker {
    queue: DoOnTime,
    sent: Mutex<HashMap<String, CallbackRecord>>,
    announced: Mutex<HashSet<String>>,
    pending: Mutex<Vec<QueuedCallback>>,
    flush: Mutex<Option<JoinHandle<()>>>,
}

struct ConductorInner {
    options: ConductorOptions,
    clock: Clock,
    resolver: Arc<dyn TimelineResolver>,
    registry: DeviceRegistry,
    events: EventSink,
    document: RwLock<Document>,
    devices: RwLock<BTreeMap<DeviceId, DeviceContainer>>,
    gate: Mutex<Gate>,
    next_resolve: Mutex<NextResolve>,
    wake: Mutex<Option<JoinHandle<()>>>,
    safety: Mutex<Option<JoinHandle<()>>>,
    callbacks: CallbackTracker,
    stats: Mutex<Stats>,
    initialized: AtomicBool,
    destroyed: AtomicBool,
    log_debug: AtomicBool,
    device_events: mpsc::UnboundedSender<DeviceEvent>,
}

/// Cloneable handle to a running conductor.
///
/// Must be created inside a tokio runtime: construction spawns the safety
/// tick and the device event forwarder.
#[derive(Clone)]
pub struct Conductor {
    inner: Arc<ConductorInner>,
}

impl Conductor {
    /// A conductor with the bundled resolver and device types.
    pub fn new(options: ConductorOptions) -> Self {
        Self::with_parts(options, Arc::new(BasicResolver::new()), DeviceRegistry::with_defaults())
    }

    pub fn with_parts(
        options: ConductorOptions,
        resolver: Arc<dyn TimelineResolver>,
        registry: DeviceRegistry,
    ) -> Self {
        let clock = options.get_current_time.clone();
        let (device_events, device_rx) = mpsc::unbounded_channel();
        let events = EventSink::new(options.event_capacity);

        let inner = Arc::new(ConductorInner {
            clock: clock.clone(),
            resolver,
            registry,
            events,
            document: RwLock::new(Document::default()),
            devices: RwLock::new(BTreeMap::new()),
            gate: Mutex::new(Gate::default()),
            next_resolve: Mutex::new(NextResolve::default()),
            wake: Mutex::new(None),
            safety: Mutex::new(None),
            callbacks: CallbackTracker {
                queue: DoOnTime::new(clock, SendMode::Burst),
                sent: Mutex::new(HashMap::new()),
                announced: Mutex::new(HashSet::new()),
                pending: Mutex::new(Vec::new()),
                flush: Mutex::new(None),
            },
            stats: Mutex::new(Stats::default()),
            initialized: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            log_debug: AtomicBool::new(options.log_debug),
            device_events,
            options,
        });

        tokio::spawn(forward_device_events(Arc::downgrade(&inner), device_rx));
        *inner.safety.lock() = Some(tokio::spawn(safety_tick(
            Arc::downgrade(&inner),
            inner.options.safety_tick,
        )));

        let conductor = Self { inner };
        if conductor.inner.options.auto_init {
            conductor.init();
        }
        conductor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConductorEvent> {
        self.inner.events.subscribe()
    }

    /// Start resolving. Passes before this only warn.
    pub fn init(&self) {
        self.inner.initialized.store(true, Ordering::SeqCst);
        self.inner.reset_resolver();
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn current_time(&self) -> Time {
        self.inner.clock.now()
    }

    pub fn mapping(&self) -> Mappings {
        self.inner.document.read().mappings.clone()
    }

    /// Replace the mapping, hand it to every device, then re-resolve.
    pub async fn set_mapping(&self, mappings: Mappings) {
        let has_timeline = {
            let mut doc = self.inner.document.write();
            doc.mappings = mappings.clone();
            !doc.timeline.is_empty()
        };
        self.propagate_mapping(mappings).await;

        if has_timeline {
            self.inner.resolve();
        }
    }

    async fn propagate_mapping(&self, mappings: Mappings) {
        let devices = self.devices();
        let results = join_all(devices.iter().map(|d| d.set_mapping(mappings.clone()))).await;
        for result in results {
            if let Err(e) = result {
                self.inner.events.error(e.to_string());
            }
        }
    }

    /// The timeline as currently held, including fixed "now" triggers.
    pub fn timeline(&self) -> Vec<TimelineObject> {
        self.inner.document.read().timeline.clone()
    }

    pub fn set_timeline(&self, timeline: Vec<TimelineObject>) {
        self.inner.start_measure("timeline received");
        self.inner.document.write().timeline = timeline;
        self.inner.reset_resolver();
    }

    pub async fn set_timeline_and_mappings(&self, timeline: Vec<TimelineObject>, mappings: Mappings) {
        self.inner.start_measure("timeline received");
        {
            let mut doc = self.inner.document.write();
            doc.timeline = timeline;
            doc.mappings = mappings.clone();
        }
        self.propagate_mapping(mappings).await;
        self.inner.reset_resolver();
    }

    pub fn log_debug(&self) -> bool {
        self.inner.log_debug.load(Ordering::Relaxed)
    }

    /// Forward device debug output as events.
    pub fn set_log_debug(&self, enabled: bool) {
        self.inner.log_debug.store(enabled, Ordering::Relaxed);
    }

    pub fn devices(&self) -> Vec<DeviceContainer> {
        self.inner.devices.read().values().cloned().collect()
    }

    pub fn device(&self, device_id: &DeviceId) -> Option<DeviceContainer> {
        self.inner.devices.read().get(device_id).cloned()
    }

    /// Build, start and initialize a device.
    pub async fn add_device(
        &self,
        device_id: impl Into<DeviceId>,
        options: DeviceOptions,
    ) -> ConductorResult<DeviceContainer> {
        let device_id = device_id.into();
        let inner = &self.inner;

        if inner.devices.read().contains_key(&device_id) {
            return Err(ConductorError::Config(format!(
                "Device \"{}\" already exists",
                device_id
            )));
        }

        let ctx = DeviceContext::new(
            device_id.clone(),
            options.device_type.clone(),
            inner.clock.clone(),
            inner.options.initialize_as_clear,
            inner.device_events.clone(),
        );
        let device = inner.registry.create(ctx, &options).inspect_err(|e| {
            inner.events.error(format!("addDevice \"{}\": {}", device_id, e));
        })?;

        inner
            .events
            .info(format!("Initializing device {} ({})...", device_id, options.device_type));
        let container = DeviceContainer::spawn(device);
        inner.devices.write().insert(device_id.clone(), container.clone());

        container.set_mapping(self.mapping()).await?;
        container.init(options.options.clone()).await.inspect_err(|e| {
            inner.events.error(format!("Initializing device {}: {}", device_id, e));
        })?;
        inner.events.info(format!("Device {} initialized", device_id));

        Ok(container)
    }

    pub async fn remove_device(&self, device_id: &DeviceId) -> ConductorResult<()> {
        let container = self
            .inner
            .devices
            .write()
            .remove(device_id)
            .ok_or_else(|| ConductorError::DeviceNotFound(device_id.clone()))?;

        match container.terminate().await {
            Ok(_) | Err(ConductorError::DeviceStopped(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Stop all timers and terminate every device.
    ///
    /// Every device is removed even if some fail; the first failure is
    /// returned after all of them have been reported.
    pub async fn destroy(&self) -> ConductorResult<()> {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        self.inner.stop_timers();
        self.inner.callbacks.queue.dispose();

        let ids: Vec<DeviceId> = self.inner.devices.read().keys().cloned().collect();
        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.remove_device(&id).await {
                self.inner.events.error(format!("Removing device {}: {}", id, e));
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Forget the scheduled resolve time and resolve from now.
    pub fn reset_resolver(&self) {
        self.inner.reset_resolver();
    }

    /// Ask every device to get ready, then resolve from scratch.
    ///
    /// A failing device is reported and skipped; the others are still made
    /// ready and the resolve still happens. Returns the first failure.
    pub async fn devices_make_ready(&self, ok_to_destroy: bool) -> ConductorResult<()> {
        let mut first_error = None;
        for device in self.devices() {
            if let Err(e) = device.make_ready(ok_to_destroy).await {
                self.inner.events.error(format!("makeReady: {}", e));
                first_error.get_or_insert(e);
            }
        }
        self.inner.reset_resolver();
        first_error.map_or(Ok(()), Err)
    }

    pub async fn devices_stand_down(&self, ok_to_destroy: bool) -> ConductorResult<()> {
        let mut first_error = None;
        for device in self.devices() {
            if let Err(e) = device.stand_down(ok_to_destroy).await {
                self.inner.events.error(format!("standDown: {}", e));
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn stat_reports(&self) -> Vec<StatReport> {
        self.inner.stats.lock().reports.clone()
    }
}

impl ConductorInner {
    fn reset_resolver(self: &Arc<Self>) {
        {
            let mut next = self.next_resolve.lock();
            next.time = None;
            next.generation += 1;
        }
        self.resolve();
    }

    /// Run a pass now, or right after the one in progress.
    fn resolve(self: &Arc<Self>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut gate = self.gate.lock();
            if gate.running {
                gate.queued = true;
                return;
            }
            gate.running = true;
        }

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let delay = match AssertUnwindSafe(this.resolve_pass()).catch_unwind().await {
                    Ok(delay) => delay,
                    Err(_) => {
                        this.events.error("Resolve pass panicked");
                        this.options.lookahead
                    }
                };
                this.arm_wake(delay);

                let again = {
                    let mut gate = this.gate.lock();
                    if gate.queued {
                        gate.queued = false;
                        true
                    } else {
                        gate.running = false;
                        false
                    }
                };
                if !again {
                    break;
                }
            }
        });
    }

    fn arm_wake(self: &Arc<Self>, delay: Time) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(millis(delay)).await;
            if let Some(inner) = weak.upgrade() {
                inner.resolve();
            }
        });
        if let Some(previous) = self.wake.lock().replace(handle) {
            previous.abort();
        }
    }

    fn stop_timers(&self) {
        for slot in [&self.wake, &self.safety, &self.callbacks.flush] {
            if let Some(handle) = slot.lock().take() {
                handle.abort();
            }
        }
    }

    /// Start timing a change. A burst of changes is timed from the first.
    fn start_measure(&self, reason: &str) {
        self.stats.lock().measure.get_or_insert_with(|| Measure {
            started: Instant::now(),
            reason: reason.to_string(),
        });
    }

    /// One resolve pass. Returns the delay until the next one.
    async fn resolve_pass(self: &Arc<Self>) -> Time {
        let lookahead = self.options.lookahead;

        if !self.initialized.load(Ordering::SeqCst) {
            self.events.warning("Resolve requested before the conductor was initialized");
            return lookahead;
        }

        let measure = self.stats.lock().measure.clone();
        let started = Instant::now();
        let now = self.clock.now();
        let (resolve_time, generation) = {
            let next = self.next_resolve.lock();
            (next.time.unwrap_or(now), next.generation)
        };

        if resolve_time > now + lookahead {
            self.events.debug(format!(
                "Too far ahead ({}), waiting for {}",
                resolve_time, lookahead
            ));
            return lookahead;
        }

        self.events.debug(format!("resolveTimeline {}", resolve_time));
        match self.run_pass(resolve_time, generation, started).await {
            Ok((delay, timings)) => {
                if let Some(measure) = measure {
                    self.report_stats(measure, timings);
                }
                self.events.info(format!(
                    "resolveTimeline at time {} done in {}ms",
                    resolve_time,
                    started.elapsed().as_millis()
                ));
                delay
            }
            Err(e) => {
                self.events.error(format!("resolveTimeline at time {}: {}", resolve_time, e));
                lookahead
            }
        }
    }

    async fn run_pass(
        self: &Arc<Self>,
        resolve_time: Time,
        generation: u64,
        started: Instant,
    ) -> ConductorResult<(Time, [Instant; 2])> {
        let lookahead = self.options.lookahead;

        let (timeline, mappings, fixation) = {
            let mut doc = self.document.write();
            let fixation = fix_now_objects(&mut doc.timeline, resolve_time, self.resolver.as_ref());
            (doc.timeline.clone(), doc.mappings.clone(), fixation)
        };
        // Rewrites are already in the document, so they are reported even if
        // the rest of the pass fails.
        if !fixation.fixed.is_empty() {
            self.events.emit(ConductorEvent::SetTimelineTriggerTime {
                fixes: fixation.fixed,
            });
        }
        if let Some(e) = fixation.error {
            return Err(e.into());
        }
        if fixation.cap_reached {
            self.events.warning(format!(
                "Could not fix \"now\" triggers of {:?} in {} iterations",
                fixation.unresolved,
                now::MAX_FIX_ITERATIONS
            ));
        }

        let state = self.resolver.get_state(&timeline, resolve_time)?;
        let resolved_at = Instant::now();

        let devices: Vec<DeviceContainer> = self.devices.read().values().cloned().collect();
        self.handle_state(&devices, &state, &mappings).await;
        let handled_at = Instant::now();

        let window =
            self.resolver
                .get_timeline_in_window(&timeline, Some(state.time), Some(state.time + lookahead))?;
        let next = self
            .resolver
            .get_next_events(&window, state.time + MIN_TIME_UNIT, 1)?;

        let delay = match next.first() {
            Some(event) => {
                let now = self.clock.now();
                self.set_next_resolve(generation, Some((state.time + lookahead).min(event.time)));
                (event.time - now - self.options.prepare_time)
                    .min(lookahead)
                    .max(self.options.min_trigger_time)
            }
            None => {
                let results = join_all(devices.iter().map(|d| d.clear_future(state.time))).await;
                for result in results {
                    if let Err(e) = result {
                        self.events.error(e.to_string());
                    }
                }
                self.set_next_resolve(generation, None);
                lookahead
            }
        };

        self.update_callbacks(&state);

        tracing::trace!(
            "Pass for {} took {}ms",
            resolve_time,
            started.elapsed().as_millis()
        );
        Ok((delay, [resolved_at, handled_at]))
    }

    fn set_next_resolve(&self, generation: u64, time: Option<Time>) {
        let mut next = self.next_resolve.lock();
        if next.generation == generation {
            next.time = time;
        }
    }

    /// Fan the state out to every device. Device failures are reported and
    /// never abort the pass.
    async fn handle_state(&self, devices: &[DeviceContainer], state: &TimelineState, mappings: &Mappings) {
        let results = join_all(devices.iter().map(|device| {
            let substate = state.filter_for_device(mappings, device.device_id(), device.device_type());
            let mappings = mappings.clone();
            async move {
                device.prepare_for_handle_state(state.time).await?;
                device.handle_state(substate, mappings).await
            }
        }))
        .await;

        for result in results {
            if let Err(e) = result {
                self.events.error(e.to_string());
            }
        }
    }

    fn report_stats(&self, measure: Measure, [resolved_at, handled_at]: [Instant; 2]) {
        let since = |at: Instant| at.saturating_duration_since(measure.started).as_millis() as Time;
        let report = StatReport {
            reason: measure.reason.clone(),
            timeline_resolved: since(resolved_at),
            state_handled: since(handled_at),
            done: since(Instant::now()),
        };

        {
            let mut stats = self.stats.lock();
            // Reported already, or replaced after a report.
            if stats.measure.as_ref().map(|m| m.started) != Some(measure.started) {
                return;
            }
            stats.measure = None;
            stats.reports.push(report.clone());
            if stats.reports.len() > STAT_HISTORY {
                stats.reports.remove(0);
            }
        }

        self.events.info(format!(
            "Stat report ({}): resolved {}ms, handled {}ms, done {}ms",
            report.reason, report.timeline_resolved, report.state_handled, report.done
        ));
        self.events.emit(ConductorEvent::StatReport(report));
    }

    fn update_callbacks(self: &Arc<Self>, state: &TimelineState) {
        let plan = {
            let sent = self.callbacks.sent.lock();
            let announced = self.callbacks.announced.lock();
            plan_callbacks(state, &sent, &announced)
        };

        self.callbacks.queue.clear_queue_now_and_after(state.time);
        for start in plan.starts {
            let weak = Arc::downgrade(self);
            let context = format!("callback {} of {}", start.callback, start.object_id);
            self.callbacks.queue.queue(start.time, None, context, move || async move {
                if let Some(inner) = weak.upgrade() {
                    let first = inner.callbacks.announced.lock().insert(start.id.clone());
                    if first {
                        inner.queue_callback(start);
                    }
                }
                Ok(())
            });
        }

        {
            let mut announced = self.callbacks.announced.lock();
            for stop in &plan.stops {
                announced.remove(&stop.id);
            }
            announced.retain(|id| plan.records.contains_key(id));
        }
        for stop in plan.stops {
            self.queue_callback(stop);
        }

        *self.callbacks.sent.lock() = plan.records;
    }

    /// Collect a due callback; the batch is flushed once it has been quiet.
    fn queue_callback(self: &Arc<Self>, callback: QueuedCallback) {
        self.callbacks.pending.lock().push(callback);

        let weak = Arc::downgrade(self);
        let batch = self.options.callback_batch;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(millis(batch)).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush_callbacks();
            }
        });
        if let Some(previous) = self.callbacks.flush.lock().replace(handle) {
            previous.abort();
        }
    }

    fn flush_callbacks(&self) {
        let batch = std::mem::take(&mut *self.callbacks.pending.lock());
        for cb in debounce_callbacks(batch, self.options.callback_debounce) {
            self.events.emit(ConductorEvent::TimelineCallback {
                time: cb.time,
                object_id: cb.object_id,
                callback: cb.callback,
                data: cb.data,
            });
        }
    }

    fn on_device_event(self: &Arc<Self>, event: DeviceEvent) {
        let id = event.device_id;
        match event.kind {
            DeviceEventKind::Debug(message) => {
                if self.log_debug.load(Ordering::Relaxed) {
                    self.events.debug(format!("{}: {}", id, message));
                }
            }
            DeviceEventKind::Info(message) => self.events.info(format!("{}: {}", id, message)),
            DeviceEventKind::Warning(message) => {
                self.events.warning(format!("{}: {}", id, message))
            }
            DeviceEventKind::Error { context, message } => {
                self.events.error(format!("{}: {}: {}", id, context, message))
            }
            DeviceEventKind::ResetResolver => self.reset_resolver(),
            DeviceEventKind::SlowCommand(message) => {
                self.events.emit(ConductorEvent::SlowCommand {
                    device_id: id,
                    message,
                })
            }
            DeviceEventKind::ConnectionChanged(status) => self.events.info(format!(
                "{}: connection status {:?}",
                id, status.status_code
            )),
        }
    }
}

impl Drop for ConductorInner {
    fn drop(&mut self) {
        self.stop_timers();
        self.callbacks.queue.dispose();
    }
}

async fn forward_device_events(
    inner: Weak<ConductorInner>,
    mut rx: mpsc::UnboundedReceiver<DeviceEvent>,
) {
    while let Some(event) = rx.recv().await {
        match inner.upgrade() {
            Some(inner) => inner.on_device_event(event),
            None => break,
        }
    }
}

async fn safety_tick(inner: Weak<ConductorInner>, period: Time) {
    let mut interval = tokio::time::interval(millis(period.max(1)));
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        if inner.initialized.load(Ordering::SeqCst) {
            inner.resolve();
        }
    }
}
