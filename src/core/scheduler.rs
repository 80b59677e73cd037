// Time-keyed command scheduling

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::types::Time;

/// Default delay after the target time before a start counts as slow.
pub const SLOW_COMMAND_LIMIT: Time = 40;

/// Finished command states kept for `state_of`.
const STATE_HISTORY: usize = 1000;

pub type CommandFuture = BoxFuture<'static, anyhow::Result<()>>;
type Executor = Box<dyn FnOnce() -> CommandFuture + Send>;

/// Delivery discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SendMode {
    /// Entries fire independently as soon as they are due.
    #[default]
    Burst,
    /// Entries run one at a time by increasing target time.
    InOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandState {
    Pending,
    Fired,
    Acknowledged,
    Failed,
    Superseded,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Error {
        context: String,
        message: String,
    },
    SlowCommand {
        context: String,
        target_time: Time,
        started_at: Time,
    },
}

pub type SchedulerEventSink = Arc<dyn Fn(SchedulerEvent) + Send + Sync>;

/// A pending entry as seen from outside.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub id: u64,
    pub time: Time,
    pub token: Option<String>,
    pub context: String,
}

struct Entry {
    time: Time,
    token: Option<String>,
    context: String,
    executor: Executor,
}

#[derive(Default)]
struct QueueInner {
    next_id: u64,
    entries: BTreeMap<u64, Entry>,
    states: HashMap<u64, CommandState>,
    finished: VecDeque<u64>,
    disposed: bool,
}

impl QueueInner {
    fn finish(&mut self, id: u64, state: CommandState) {
        self.states.insert(id, state);
        self.finished.push_back(id);
        while self.finished.len() > STATE_HISTORY {
            if let Some(old) = self.finished.pop_front() {
                self.states.remove(&old);
            }
        }
    }

    fn cancel_where(&mut self, pred: impl Fn(&Entry) -> bool) -> usize {
        let ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| pred(e))
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            self.entries.remove(id);
            self.finish(*id, CommandState::Cancelled);
        }
        ids.len()
    }

    fn next_time(&self) -> Option<Time> {
        self.entries.values().map(|e| e.time).min()
    }

    /// Remove due entries in (time, id) order and mark them fired.
    fn take_due(&mut self, now: Time, limit: usize) -> Vec<(u64, Entry)> {
        let mut due: Vec<(Time, u64)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.time <= now)
            .map(|(id, e)| (e.time, *id))
            .collect();
        due.sort_unstable();
        due.truncate(limit);

        due.into_iter()
            .filter_map(|(_, id)| {
                let entry = self.entries.remove(&id)?;
                self.states.insert(id, CommandState::Fired);
                Some((id, entry))
            })
            .collect()
    }
}

struct Shared {
    inner: Mutex<QueueInner>,
    notify: Notify,
    clock: Clock,
    mode: SendMode,
    slow_limit: AtomicI64,
    sink: RwLock<Option<SchedulerEventSink>>,
}

impl Shared {
    fn emit(&self, event: SchedulerEvent) {
        if let Some(sink) = self.sink.read().as_ref() {
            sink(event);
        }
    }
}

/// Time-keyed queue of pending command executions.
///
/// A single ticker task sleeps until the earliest entry is due. Supplying a
/// token that is already pending supersedes that entry instead of adding a
/// second one.
pub struct DoOnTime {
    shared: Arc<Shared>,
    ticker: JoinHandle<()>,
}

impl DoOnTime {
    /// Must be called from within a tokio runtime.
    pub fn new(clock: Clock, mode: SendMode) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            clock,
            mode,
            slow_limit: AtomicI64::new(SLOW_COMMAND_LIMIT),
            sink: RwLock::new(None),
        });
        let ticker = tokio::spawn(Self::run(shared.clone()));
        Self { shared, ticker }
    }

    pub fn set_event_sink(&self, sink: SchedulerEventSink) {
        *self.shared.sink.write() = Some(sink);
    }

    pub fn set_slow_command_limit(&self, limit: Time) {
        self.shared.slow_limit.store(limit, Ordering::Relaxed);
    }

    pub fn send_mode(&self) -> SendMode {
        self.shared.mode
    }

    /// Register `executor` to run once the clock reaches `time`.
    pub fn queue<F, Fut>(
        &self,
        time: Time,
        token: Option<&str>,
        context: impl Into<String>,
        executor: F,
    ) -> u64
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let context = context.into();
        let executor: Executor = Box::new(move || executor().boxed());

        let id = {
            let mut inner = self.shared.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;

            if inner.disposed {
                inner.finish(id, CommandState::Cancelled);
                return id;
            }

            if let Some(token) = token {
                let previous = inner
                    .entries
                    .iter()
                    .find(|(_, e)| e.token.as_deref() == Some(token))
                    .map(|(id, _)| *id);
                if let Some(previous) = previous {
                    inner.entries.remove(&previous);
                    inner.finish(previous, CommandState::Superseded);
                    tracing::trace!("Token {} superseded entry {}", token, previous);
                }
            }

            inner.entries.insert(
                id,
                Entry {
                    time,
                    token: token.map(str::to_string),
                    context,
                    executor,
                },
            );
            inner.states.insert(id, CommandState::Pending);
            id
        };

        self.shared.notify.notify_one();
        id
    }

    /// Drop all entries with target time >= `time`.
    pub fn clear_queue_now_and_after(&self, time: Time) -> usize {
        self.shared.inner.lock().cancel_where(|e| e.time >= time)
    }

    /// Drop all entries with target time > `time`.
    pub fn clear_queue_after(&self, time: Time) -> usize {
        self.shared.inner.lock().cancel_where(|e| e.time > time)
    }

    pub fn get_queue(&self) -> Vec<QueueEntry> {
        let inner = self.shared.inner.lock();
        let mut queue: Vec<QueueEntry> = inner
            .entries
            .iter()
            .map(|(id, e)| QueueEntry {
                id: *id,
                time: e.time,
                token: e.token.clone(),
                context: e.context.clone(),
            })
            .collect();
        queue.sort_by_key(|e| (e.time, e.id));
        queue
    }

    pub fn state_of(&self, id: u64) -> Option<CommandState> {
        self.shared.inner.lock().states.get(&id).copied()
    }

    /// Cancel everything pending and stop the ticker.
    pub fn dispose(&self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.cancel_where(|_| true);
            inner.disposed = true;
        }
        self.ticker.abort();
    }

    async fn run(shared: Arc<Shared>) {
        loop {
            let next = shared.inner.lock().next_time();
            let Some(time) = next else {
                shared.notify.notified().await;
                continue;
            };

            let wait = shared.clock.until(time);
            if !wait.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shared.notify.notified() => {}
                }
                continue;
            }

            let now = shared.clock.now();
            match shared.mode {
                SendMode::Burst => {
                    let due = shared.inner.lock().take_due(now, usize::MAX);
                    for (id, entry) in due {
                        tokio::spawn(Self::execute(shared.clone(), id, entry));
                    }
                }
                SendMode::InOrder => {
                    // One at a time so later entries can still be cancelled.
                    let due = shared.inner.lock().take_due(now, 1);
                    for (id, entry) in due {
                        Self::execute(shared.clone(), id, entry).await;
                    }
                }
            }
        }
    }

    async fn execute(shared: Arc<Shared>, id: u64, entry: Entry) {
        let Entry {
            time,
            context,
            executor,
            ..
        } = entry;

        let started_at = shared.clock.now();
        if started_at - time > shared.slow_limit.load(Ordering::Relaxed) {
            tracing::warn!(
                "Slow command {} started {}ms late: {}",
                id,
                started_at - time,
                context
            );
            shared.emit(SchedulerEvent::SlowCommand {
                context: context.clone(),
                target_time: time,
                started_at,
            });
        }

        let outcome = AssertUnwindSafe(async move { executor().await })
            .catch_unwind()
            .await;

        let state = match outcome {
            Ok(Ok(())) => CommandState::Acknowledged,
            Ok(Err(e)) => {
                tracing::error!("Command {} failed ({}): {}", id, context, e);
                shared.emit(SchedulerEvent::Error {
                    context,
                    message: e.to_string(),
                });
                CommandState::Failed
            }
            Err(_) => {
                tracing::error!("Command {} panicked ({})", id, context);
                shared.emit(SchedulerEvent::Error {
                    context,
                    message: "executor panicked".to_string(),
                });
                CommandState::Failed
            }
        };

        shared.inner.lock().finish(id, state);
    }
}

impl Drop for DoOnTime {
    fn drop(&mut self) {
        self.ticker.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<(String, Time)>>>;

    fn record(
        log: &Log,
        clock: &Clock,
        name: &str,
    ) -> impl Future<Output = anyhow::Result<()>> + Send + 'static {
        let log = log.clone();
        let clock = clock.clone();
        let name = name.to_string();
        async move {
            log.lock().push((name, clock.now()));
            Ok(())
        }
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_supersedes_pending_entry() {
        let clock = Clock::starting_at(0);
        let queue = DoOnTime::new(clock.clone(), SendMode::Burst);
        let log: Log = Arc::default();

        let a = {
            let fut = record(&log, &clock, "A");
            queue.queue(100, Some("t1"), "A", move || fut)
        };
        let b = {
            let fut = record(&log, &clock, "B");
            queue.queue(200, Some("t1"), "B", move || fut)
        };
        assert_eq!(queue.get_queue().len(), 1);

        advance(300).await;

        let log = log.lock().clone();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, "B");
        assert!((200..=201).contains(&log[0].1));
        assert_eq!(queue.state_of(a), Some(CommandState::Superseded));
        assert_eq!(queue.state_of(b), Some(CommandState::Acknowledged));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_queue_after_cancels_future_entries() {
        let clock = Clock::starting_at(0);
        let queue = DoOnTime::new(clock.clone(), SendMode::Burst);
        let log: Log = Arc::default();

        let mut ids = Vec::new();
        for (name, time) in [("early", 50), ("edge", 100), ("late", 150)] {
            let fut = record(&log, &clock, name);
            ids.push(queue.queue(time, None, name, move || fut));
        }

        assert_eq!(queue.clear_queue_after(100), 1);
        advance(500).await;

        let names: Vec<_> = log.lock().iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(names, vec!["early", "edge"]);
        assert_eq!(queue.state_of(ids[2]), Some(CommandState::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_queue_now_and_after_includes_boundary() {
        let clock = Clock::starting_at(0);
        let queue = DoOnTime::new(clock.clone(), SendMode::Burst);
        let log: Log = Arc::default();

        for (name, time) in [("early", 50), ("edge", 100)] {
            let fut = record(&log, &clock, name);
            queue.queue(time, None, name, move || fut);
        }

        assert_eq!(queue.clear_queue_now_and_after(100), 1);
        advance(500).await;

        assert_eq!(log.lock().len(), 1);
        assert!(queue.get_queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_order_serializes_execution() {
        let clock = Clock::starting_at(0);
        let queue = DoOnTime::new(clock.clone(), SendMode::InOrder);
        let log: Log = Arc::default();

        for (name, time) in [("second", 20), ("first", 10), ("third", 20)] {
            let log = log.clone();
            let clock = clock.clone();
            queue.queue(time, None, name, move || async move {
                log.lock().push((format!("{name}:start"), clock.now()));
                tokio::time::sleep(Duration::from_millis(30)).await;
                log.lock().push((format!("{name}:end"), clock.now()));
                Ok(())
            });
        }

        advance(200).await;

        let names: Vec<_> = log.lock().iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(
            names,
            vec![
                "first:start",
                "first:end",
                "second:start",
                "second:end",
                "third:start",
                "third:end"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_is_reported_and_queue_continues() {
        let clock = Clock::starting_at(0);
        let queue = DoOnTime::new(clock.clone(), SendMode::InOrder);
        let events: Arc<Mutex<Vec<SchedulerEvent>>> = Arc::default();
        {
            let events = events.clone();
            queue.set_event_sink(Arc::new(move |e| events.lock().push(e)));
        }
        let log: Log = Arc::default();

        let failing = queue.queue(10, None, "broken", || async {
            Err::<(), _>(anyhow::anyhow!("boom"))
        });
        let panicking = queue.queue(11, None, "panics", || async {
            let fail = true;
            if fail {
                panic!("kaboom");
            }
            Ok(())
        });
        let fut = record(&log, &clock, "ok");
        let ok = queue.queue(12, None, "ok", move || fut);

        advance(100).await;

        assert_eq!(queue.state_of(failing), Some(CommandState::Failed));
        assert_eq!(queue.state_of(panicking), Some(CommandState::Failed));
        assert_eq!(queue.state_of(ok), Some(CommandState::Acknowledged));
        assert_eq!(log.lock().len(), 1);

        let events = events.lock();
        assert!(matches!(
            &events[0],
            SchedulerEvent::Error { context, message } if context == "broken" && message == "boom"
        ));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_emits_slow_command() {
        let clock = Clock::starting_at(0);
        let queue = DoOnTime::new(clock.clone(), SendMode::InOrder);
        let events: Arc<Mutex<Vec<SchedulerEvent>>> = Arc::default();
        {
            let events = events.clone();
            queue.set_event_sink(Arc::new(move |e| events.lock().push(e)));
        }

        queue.queue(10, None, "hog", || async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        });
        queue.queue(20, None, "victim", || async { Ok(()) });

        advance(300).await;

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            SchedulerEvent::SlowCommand { context, target_time: 20, .. } if context == "victim"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_cancels_pending() {
        let clock = Clock::starting_at(0);
        let queue = DoOnTime::new(clock.clone(), SendMode::Burst);
        let id = queue.queue(100, None, "never", || async { Ok(()) });

        queue.dispose();
        advance(200).await;

        assert_eq!(queue.state_of(id), Some(CommandState::Cancelled));
        let late = queue.queue(300, None, "late", || async { Ok(()) });
        assert_eq!(queue.state_of(late), Some(CommandState::Cancelled));
    }
}
