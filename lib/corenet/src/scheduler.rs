//! Prioritized cooperative task runner (C3, spec §4.1) plus its weak-referent variant (C10,
//! spec §4.9).
//!
//! A step may be synchronous or may suspend — `Task::run` returns a boxed future either way
//! (SPEC_FULL §4.1), so the scheduler always awaits the result and a plain `async fn` body
//! and a `std::future::ready(())` body cost the same to drive. Tasks are bucketed by
//! priority in a `BTreeMap` so ascending iteration and "garbage-collect empty buckets" are
//! both native `BTreeMap` operations, per SPEC_FULL §4.1.
use flux::logging::{warn, Logger, LoggerFactory};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::{Rc, Weak};

use crate::clock::Clock;
use crate::error::CoreResult;

pub type BoxFuture = Pin<Box<dyn Future<Output = CoreResult<()>>>>;

/// Identifies a registered task for `remove_task`. Opaque and cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

/// A periodically-fired unit of work. `step` is called with the elapsed time since its last
/// execution; `remaining` governs how many more times it fires before self-removing (`None`
/// means unbounded).
pub trait Task {
    fn period_millis(&self) -> u64;
    fn priority(&self) -> i32;
    fn remaining(&self) -> Option<u32>;
    fn set_remaining(&self, value: Option<u32>);
    /// `delta` is the elapsed milliseconds since this task's last execution. A task that
    /// fails is isolated to itself (spec §5, §7 "Task failure"): the scheduler logs the
    /// error and moves on, it never aborts siblings nor stops the loop.
    fn run(self: Rc<Self>, delta: u64) -> BoxFuture;
}

/// `lastExecution = +∞` sentinel (spec §4.1): while a task's handle is awaiting completion,
/// no tick may re-enter it. `u64::MAX` can never be a real "now" reading from `Clock`.
const IN_PROGRESS: u64 = u64::MAX;

struct TaskHandle {
    id: TaskId,
    last_execution: Cell<u64>,
    task: Rc<dyn Task>,
}

/// Fires registered tasks on a fixed tick, ascending by priority; same-priority tasks launch
/// concurrently and are all awaited (settled, failures logged) before the next priority
/// starts (spec §4.1).
pub struct Scheduler {
    clock: Clock,
    buckets: BTreeMap<i32, Vec<TaskHandle>>,
    next_id: u64,
    tick_count: u64,
    running: bool,
    logger: Logger,
}

impl Scheduler {
    pub fn new(clock: Clock, logging: &LoggerFactory) -> Scheduler {
        Scheduler {
            clock,
            buckets: BTreeMap::new(),
            next_id: 1,
            tick_count: 0,
            running: false,
            logger: logging.build("scheduler", None),
        }
    }

    /// Idempotent: a second call while running has no effect (spec §4.1).
    pub fn init(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        self.tick_count = 0;
    }

    /// Clears the registry and resets the tick counter. Tasks already awaiting inside an
    /// in-flight `tick()` call are not cancelled by this — spec §4.1: "pending promises from
    /// in-flight tasks are not awaited; their eventual completion must not touch the
    /// scheduler state" — which holds here because each `TaskHandle` this drops is the only
    /// owner of its `last_execution` cell; the in-flight future holds its own `Rc<dyn Task>`
    /// clone and writes to the task's own interior state, never back into this map.
    pub fn stop(&mut self) {
        self.running = false;
        self.buckets.clear();
        self.tick_count = 0;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Duplicate add (by `Rc` pointer identity) logs a warning and is a no-op (spec §4.1).
    pub fn add_task(&mut self, task: Rc<dyn Task>) -> TaskId {
        let priority = task.priority();
        if self
            .buckets
            .get(&priority)
            .into_iter()
            .flatten()
            .any(|handle| Rc::ptr_eq(&handle.task, &task))
        {
            warn!(self.logger, "duplicate task add ignored"; "priority" => priority);
            return TaskId(0);
        }

        let id = TaskId(self.next_id);
        self.next_id += 1;
        self.buckets.entry(priority).or_default().push(TaskHandle {
            id,
            last_execution: Cell::new(self.clock.now_millis()),
            task,
        });
        id
    }

    /// Spurious remove (unknown id) logs a warning and is a no-op (spec §4.1).
    pub fn remove_task(&mut self, id: TaskId) {
        let mut found = false;
        self.buckets.retain(|_, handles| {
            handles.retain(|handle| {
                let keep = handle.id != id;
                found |= !keep;
                keep
            });
            !handles.is_empty()
        });
        if !found {
            warn!(self.logger, "remove_task: unknown task id"; "id" => id.0);
        }
    }

    /// Runs one iteration: ascending priority, same-priority tasks concurrent, each priority
    /// level fully settled before the next starts. Returns the tick counter after
    /// incrementing (spec §4.1 "tick() — returns the number of completed iterations").
    pub async fn tick(&mut self) -> u64 {
        self.tick_count += 1;
        let now = self.clock.now_millis();

        let priorities: Vec<i32> = self.buckets.keys().copied().collect();
        for priority in priorities {
            let due: Vec<(usize, u64, Rc<dyn Task>)> = {
                let handles = match self.buckets.get(&priority) {
                    Some(h) => h,
                    None => continue,
                };
                handles
                    .iter()
                    .enumerate()
                    .filter_map(|(index, handle)| {
                        let last = handle.last_execution.get();
                        if last == IN_PROGRESS {
                            return None;
                        }
                        let delta = now.saturating_sub(last);
                        if delta < handle.task.period_millis() {
                            return None;
                        }
                        handle.last_execution.set(IN_PROGRESS);
                        Some((index, delta, Rc::clone(&handle.task)))
                    })
                    .collect()
            };

            if due.is_empty() {
                continue;
            }

            let logger = self.logger.clone();
            let futures = due
                .iter()
                .map(|(_, delta, task)| Rc::clone(task).run(*delta))
                .collect::<Vec<_>>();
            let results = futures_util::future::join_all(futures).await;
            for result in results {
                if let Err(err) = result {
                    warn!(logger, "task failed"; "priority" => priority, "error" => %err);
                }
            }

            if let Some(handles) = self.buckets.get(&priority) {
                for (index, _, task) in &due {
                    if let Some(handle) = handles.get(*index) {
                        handle.last_execution.set(now);
                        if let Some(remaining) = task.remaining() {
                            let next = remaining.saturating_sub(1);
                            task.set_remaining(Some(next));
                            if next == 0 {
                                warn!(logger, "task exhausted remaining executions"; "priority" => priority);
                            }
                        }
                    }
                }
            }
        }

        // Empty priority buckets are garbage-collected (spec §4.1).
        self.buckets.retain(|_, handles| !handles.is_empty());
        self.buckets
            .values_mut()
            .for_each(|handles| handles.retain(|h| h.task.remaining() != Some(0)));

        self.tick_count
    }
}

/// Weak-ref scheduler variant (C10, spec §4.9): holds a weak reference to an object and
/// stops itself once the object is gone, rather than the caller needing to track the
/// object's lifetime separately.
pub struct EntityTask<T, F> {
    referent: Weak<T>,
    period_millis: u64,
    priority: i32,
    remaining: Cell<Option<u32>>,
    callback: F,
}

impl<T, F, Fut> EntityTask<T, F>
where
    T: 'static,
    F: Fn(Rc<T>, u64) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    pub fn new(referent: &Rc<T>, period_millis: u64, priority: i32, callback: F) -> Rc<EntityTask<T, F>> {
        Rc::new(EntityTask {
            referent: Rc::downgrade(referent),
            period_millis,
            priority,
            remaining: Cell::new(None),
            callback,
        })
    }
}

impl<T, F, Fut> Task for EntityTask<T, F>
where
    T: 'static,
    F: Fn(Rc<T>, u64) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
{
    fn period_millis(&self) -> u64 {
        self.period_millis
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn remaining(&self) -> Option<u32> {
        self.remaining.get()
    }

    fn set_remaining(&self, value: Option<u32>) {
        self.remaining.set(value);
    }

    fn run(self: Rc<Self>, delta: u64) -> BoxFuture {
        match self.referent.upgrade() {
            Some(object) => Box::pin(async move {
                (self.callback)(object, delta).await;
                Ok(())
            }),
            // The referent is gone; stop by reporting zero remaining executions so the next
            // tick's cleanup pass drops this handle.
            None => {
                self.remaining.set(Some(0));
                Box::pin(std::future::ready(Ok(())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct CountingTask {
        period_millis: u64,
        priority: i32,
        remaining: Cell<Option<u32>>,
        runs: Rc<RefCell<Vec<u64>>>,
    }

    impl Task for CountingTask {
        fn period_millis(&self) -> u64 {
            self.period_millis
        }
        fn priority(&self) -> i32 {
            self.priority
        }
        fn remaining(&self) -> Option<u32> {
            self.remaining.get()
        }
        fn set_remaining(&self, value: Option<u32>) {
            self.remaining.set(value);
        }
        fn run(self: Rc<Self>, delta: u64) -> BoxFuture {
            self.runs.borrow_mut().push(delta);
            Box::pin(std::future::ready(Ok(())))
        }
    }

    struct FailingTask {
        remaining: Cell<Option<u32>>,
    }

    impl Task for FailingTask {
        fn period_millis(&self) -> u64 {
            0
        }
        fn priority(&self) -> i32 {
            0
        }
        fn remaining(&self) -> Option<u32> {
            self.remaining.get()
        }
        fn set_remaining(&self, value: Option<u32>) {
            self.remaining.set(value);
        }
        fn run(self: Rc<Self>, _delta: u64) -> BoxFuture {
            Box::pin(std::future::ready(Err(crate::error::CoreError::ValidationFailed)))
        }
    }

    fn logging() -> LoggerFactory {
        LoggerFactory::new(flux::logging::LogConfig::default())
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn task_below_period_is_skipped() {
        let clock = Clock::new();
        let mut scheduler = Scheduler::new(clock, &logging());
        scheduler.init();

        let runs = Rc::new(RefCell::new(Vec::new()));
        let task = Rc::new(CountingTask {
            period_millis: 1_000,
            priority: 0,
            remaining: Cell::new(None),
            runs: Rc::clone(&runs),
        });
        scheduler.add_task(task);

        scheduler.tick().await;
        assert!(runs.borrow().is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn duplicate_add_is_ignored() {
        let clock = Clock::new();
        let mut scheduler = Scheduler::new(clock, &logging());
        scheduler.init();

        let runs = Rc::new(RefCell::new(Vec::new()));
        let task: Rc<dyn Task> = Rc::new(CountingTask {
            period_millis: 0,
            priority: 5,
            remaining: Cell::new(None),
            runs: Rc::clone(&runs),
        });
        scheduler.add_task(Rc::clone(&task));
        scheduler.add_task(Rc::clone(&task));

        assert_eq!(scheduler.buckets.get(&5).map(|h| h.len()), Some(1));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn exhausted_task_is_collected() {
        let clock = Clock::new();
        let mut scheduler = Scheduler::new(clock, &logging());
        scheduler.init();

        let runs = Rc::new(RefCell::new(Vec::new()));
        let task = Rc::new(CountingTask {
            period_millis: 0,
            priority: 0,
            remaining: Cell::new(Some(1)),
            runs,
        });
        scheduler.add_task(task);

        scheduler.tick().await;
        assert!(scheduler.buckets.is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn weak_task_self_removes_after_referent_drops() {
        let clock = Clock::new();
        let mut scheduler = Scheduler::new(clock, &logging());
        scheduler.init();

        let referent = Rc::new(42u32);
        let task = EntityTask::new(&referent, 0, 0, |_object, _delta| async {});
        scheduler.add_task(task);
        drop(referent);

        scheduler.tick().await;
        assert!(scheduler.buckets.is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn a_failing_task_does_not_stop_its_siblings_or_the_tick() {
        let clock = Clock::new();
        let mut scheduler = Scheduler::new(clock, &logging());
        scheduler.init();

        let runs = Rc::new(RefCell::new(Vec::new()));
        scheduler.add_task(Rc::new(FailingTask { remaining: Cell::new(None) }));
        scheduler.add_task(Rc::new(CountingTask {
            period_millis: 0,
            priority: 0,
            remaining: Cell::new(None),
            runs: Rc::clone(&runs),
        }));

        let tick_count = scheduler.tick().await;
        assert_eq!(tick_count, 1);
        assert_eq!(*runs.borrow(), vec![0]);
    }
}
