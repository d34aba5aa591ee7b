use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::RandomState;
use parking_lot::{Condvar, Mutex};

use crate::{DataCell, InterpreterStatus, RefHandle, Result, StackfulCoroutine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(u32);

impl PromiseId {
    pub(crate) fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promise#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitReason {
    Promise(PromiseId),
    Timer(Instant),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Suspended(WaitReason),
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskType {
    Main,
    Worker,
}

/// A cooperatively scheduled unit of execution.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    task_type: TaskType,
    state: TaskState,
    coro: StackfulCoroutine,
    completion: Option<PromiseId>,
}

impl Task {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn coro(&self) -> &StackfulCoroutine {
        &self.coro
    }

    pub fn coro_mut(&mut self) -> &mut StackfulCoroutine {
        &mut self.coro
    }

    /// The promise resolved with the task's result when it finishes.
    pub fn completion(&self) -> Option<PromiseId> {
        self.completion
    }
}

#[derive(Debug)]
enum PromiseState {
    Pending(Vec<TaskId>),
    Resolved(DataCell),
}

/// A promise entry. `future` is a weak link to the heap future that
/// takes over the value once the promise is resolved.
#[derive(Debug)]
struct Promise {
    state: PromiseState,
    future: Option<RefHandle>,
}

// ── Settings ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub initial_task_capacity: usize,
    /// Upper bound on a single wait inside `blocking_poll` while async
    /// handles are outstanding.
    pub max_blocking_wait: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            initial_task_capacity: 16,
            max_blocking_wait: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerCreateInfo {
    pub initial_task_capacity: Option<usize>,
    pub max_blocking_wait: Option<Duration>,
}

impl SchedulerSettings {
    pub fn from_create_info(info: &SchedulerCreateInfo) -> Self {
        let defaults = Self::default();
        Self {
            initial_task_capacity: info
                .initial_task_capacity
                .unwrap_or(defaults.initial_task_capacity),
            max_blocking_wait: info.max_blocking_wait.unwrap_or(defaults.max_blocking_wait),
        }
    }
}

// ── Cross-thread completion ───────────────────────────────────────────

#[derive(Debug, Default)]
struct AsyncQueue {
    completed: Vec<(PromiseId, DataCell)>,
    outstanding: usize,
}

#[derive(Debug, Default)]
struct AsyncShared {
    queue: Mutex<AsyncQueue>,
    wake: Condvar,
}

/// Lets another thread complete a promise. Dropping the handle without
/// completing it abandons the promise.
#[derive(Debug)]
pub struct AsyncHandle {
    shared: Arc<AsyncShared>,
    promise: PromiseId,
    done: bool,
}

impl AsyncHandle {
    pub fn promise(&self) -> PromiseId {
        self.promise
    }

    pub fn complete(mut self, value: DataCell) {
        let mut queue = self.shared.queue.lock();
        queue.completed.push((self.promise, value));
        queue.outstanding -= 1;
        self.done = true;
        self.shared.wake.notify_one();
    }
}

impl Drop for AsyncHandle {
    fn drop(&mut self) {
        if !self.done {
            self.shared.queue.lock().outstanding -= 1;
            self.shared.wake.notify_one();
        }
    }
}

// ── Scheduler ─────────────────────────────────────────────────────────

/// Interleaves tasks cooperatively. Exactly one task runs at a time and
/// switches only happen when the interpreter asks for the next ready task.
#[derive(Debug)]
pub struct SystemScheduler {
    settings: SchedulerSettings,
    tasks: HashMap<TaskId, Task, RandomState>,
    ready: VecDeque<TaskId>,
    current: Option<TaskId>,
    main: TaskId,
    next_task: u32,
    promises: HashMap<PromiseId, Promise, RandomState>,
    next_promise: u32,
    timers: BinaryHeap<Reverse<(Instant, TaskId)>>,
    shared: Arc<AsyncShared>,
}

fn unknown_task(id: TaskId) -> InterpreterStatus {
    InterpreterStatus::invariant(format!("unknown {id}"))
}

fn unknown_promise(id: PromiseId) -> InterpreterStatus {
    InterpreterStatus::invariant(format!("unknown {id}"))
}

impl SystemScheduler {
    /// Creates the scheduler with its main task running on an empty
    /// coroutine.
    pub fn new(settings: SchedulerSettings) -> Self {
        let main = TaskId(0);
        let mut tasks =
            HashMap::with_capacity_and_hasher(settings.initial_task_capacity, RandomState::new());
        tasks.insert(
            main,
            Task {
                id: main,
                task_type: TaskType::Main,
                state: TaskState::Running,
                coro: StackfulCoroutine::new(),
                completion: None,
            },
        );
        Self {
            settings,
            tasks,
            ready: VecDeque::new(),
            current: Some(main),
            main,
            next_task: 1,
            promises: HashMap::default(),
            next_promise: 0,
            timers: BinaryHeap::new(),
            shared: Arc::default(),
        }
    }

    pub fn main_task(&self) -> TaskId {
        self.main
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn current_task(&self) -> Option<&Task> {
        self.tasks.get(&self.current?)
    }

    pub fn current_task_id(&self) -> Option<TaskId> {
        self.current
    }

    pub fn current_coro(&self) -> Option<&StackfulCoroutine> {
        self.current_task().map(Task::coro)
    }

    pub fn current_coro_mut(&mut self) -> Option<&mut StackfulCoroutine> {
        let id = self.current?;
        self.tasks.get_mut(&id).map(Task::coro_mut)
    }

    pub fn push_current(&mut self, value: DataCell) -> Result<()> {
        self.current_coro_mut()
            .ok_or_else(|| InterpreterStatus::invariant("no current task"))?
            .push_data(value);
        Ok(())
    }

    /// Registers a worker task running on `coro`. The task is ready
    /// immediately; its result resolves the returned task's completion
    /// promise.
    pub fn create_task(&mut self, coro: StackfulCoroutine) -> TaskId {
        let id = TaskId(self.next_task);
        self.next_task += 1;
        let completion = self.create_promise();
        self.tasks.insert(
            id,
            Task {
                id,
                task_type: TaskType::Worker,
                state: TaskState::Ready,
                coro,
                completion: Some(completion),
            },
        );
        self.ready.push_back(id);
        log::debug!("created {id}");
        id
    }

    /// Makes a suspended task ready again. Returns false if it was not
    /// suspended.
    pub fn resume_task(&mut self, id: TaskId) -> Result<bool> {
        let task = self.tasks.get_mut(&id).ok_or_else(|| unknown_task(id))?;
        if !matches!(task.state, TaskState::Suspended(_)) {
            return Ok(false);
        }
        task.state = TaskState::Ready;
        self.ready.push_back(id);
        Ok(true)
    }

    /// Suspends the current task. The interpreter picks another task
    /// before it executes the next instruction.
    pub fn suspend_task(&mut self, reason: WaitReason) -> Result<TaskId> {
        let id = self
            .current
            .take()
            .ok_or_else(|| InterpreterStatus::invariant("no current task"))?;
        let task = self.tasks.get_mut(&id).ok_or_else(|| unknown_task(id))?;
        task.state = TaskState::Suspended(reason);
        log::trace!("suspended {id} ({reason:?})");
        Ok(id)
    }

    pub fn destroy_task(&mut self, id: TaskId) -> Option<Task> {
        if self.current == Some(id) {
            self.current = None;
        }
        self.ready.retain(|&ready| ready != id);
        self.tasks.remove(&id)
    }

    /// Finishes a worker task with `result`, resolving its completion
    /// promise.
    pub fn terminate_task(&mut self, id: TaskId, result: DataCell) -> Result<()> {
        let mut task = self.destroy_task(id).ok_or_else(|| unknown_task(id))?;
        task.state = TaskState::Halted;
        log::debug!("{id} finished with {result}");
        match task.completion {
            Some(promise) => self.resolve_promise(promise, result),
            None => Ok(()),
        }
    }

    /// Rotates to the next ready task. A still running current task goes
    /// to the back of the queue. Returns the task that is current
    /// afterwards.
    pub fn select_next_ready(&mut self) -> Option<TaskId> {
        while let Some(next) = self.ready.pop_front() {
            let Some(task) = self.tasks.get(&next) else {
                continue;
            };
            if task.state != TaskState::Ready {
                continue;
            }
            if let Some(current) = self.current.take() {
                if let Some(task) = self.tasks.get_mut(&current) {
                    if task.state == TaskState::Running {
                        task.state = TaskState::Ready;
                        self.ready.push_back(current);
                    }
                }
            }
            if let Some(task) = self.tasks.get_mut(&next) {
                task.state = TaskState::Running;
            }
            self.current = Some(next);
            return Some(next);
        }
        self.current
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    // ── Promises ──────────────────────────────────────────────────────

    pub fn create_promise(&mut self) -> PromiseId {
        let id = PromiseId(self.next_promise);
        self.next_promise += 1;
        self.promises.insert(
            id,
            Promise {
                state: PromiseState::Pending(Vec::new()),
                future: None,
            },
        );
        id
    }

    /// Links the promise to the heap future that represents it.
    pub fn bind_future(&mut self, id: PromiseId, future: RefHandle) -> Result<()> {
        let promise = self.promises.get_mut(&id).ok_or_else(|| unknown_promise(id))?;
        promise.future = Some(future);
        Ok(())
    }

    pub fn promise_count(&self) -> usize {
        self.promises.len()
    }

    /// The value of a resolved promise, until the next collection hands
    /// it to the bound future.
    pub fn promise_value(&self, id: PromiseId) -> Option<&DataCell> {
        match &self.promises.get(&id)?.state {
            PromiseState::Resolved(value) => Some(value),
            PromiseState::Pending(_) => None,
        }
    }

    /// Pushes the promise's value onto the current task, or suspends the
    /// current task until the promise is resolved.
    pub fn await_promise(&mut self, id: PromiseId) -> Result<()> {
        let promise = self.promises.get(&id).ok_or_else(|| unknown_promise(id))?;
        match &promise.state {
            PromiseState::Resolved(value) => {
                let value = value.clone();
                self.push_current(value)
            }
            PromiseState::Pending(_) => {
                let task = self.suspend_task(WaitReason::Promise(id))?;
                if let Some(Promise {
                    state: PromiseState::Pending(waiters),
                    ..
                }) = self.promises.get_mut(&id)
                {
                    waiters.push(task);
                }
                Ok(())
            }
        }
    }

    /// Stores the value and readies every waiting task with the value on
    /// top of its data stack.
    pub fn resolve_promise(&mut self, id: PromiseId, value: DataCell) -> Result<()> {
        let state = &mut self
            .promises
            .get_mut(&id)
            .ok_or_else(|| unknown_promise(id))?
            .state;
        let waiters = match std::mem::replace(state, PromiseState::Resolved(value.clone())) {
            PromiseState::Pending(waiters) => waiters,
            PromiseState::Resolved(previous) => {
                *state = PromiseState::Resolved(previous);
                return Err(InterpreterStatus::invariant(format!("{id} already resolved")));
            }
        };
        for waiter in waiters {
            if let Some(task) = self.tasks.get_mut(&waiter) {
                task.coro.push_data(value.clone());
                task.state = TaskState::Ready;
                self.ready.push_back(waiter);
            }
        }
        log::trace!("resolved {id}");
        Ok(())
    }

    /// Suspends the current task until `duration` has passed. It wakes up
    /// with nil on its stack.
    pub fn register_timer(&mut self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        let task = self.suspend_task(WaitReason::Timer(deadline))?;
        self.timers.push(Reverse((deadline, task)));
        Ok(())
    }

    /// A fresh promise that another thread completes through the returned
    /// handle.
    pub fn async_handle(&mut self) -> AsyncHandle {
        let promise = self.create_promise();
        self.shared.queue.lock().outstanding += 1;
        AsyncHandle {
            shared: self.shared.clone(),
            promise,
            done: false,
        }
    }

    // ── Polling ───────────────────────────────────────────────────────

    /// Fires due timers and drains completed async handles. Returns true
    /// if a task became ready.
    pub fn poll(&mut self) -> bool {
        let mut woke = false;
        let now = Instant::now();
        while let Some(&Reverse((deadline, id))) = self.timers.peek() {
            if deadline > now {
                break;
            }
            self.timers.pop();
            if let Some(task) = self.tasks.get_mut(&id) {
                if matches!(task.state, TaskState::Suspended(WaitReason::Timer(_))) {
                    task.coro.push_data(DataCell::Nil);
                    task.state = TaskState::Ready;
                    self.ready.push_back(id);
                    woke = true;
                }
            }
        }

        let completed = std::mem::take(&mut self.shared.queue.lock().completed);
        for (promise, value) in completed {
            let waiting = matches!(
                self.promises.get(&promise),
                Some(Promise { state: PromiseState::Pending(waiters), .. }) if !waiters.is_empty()
            );
            if let Err(status) = self.resolve_promise(promise, value) {
                log::debug!("dropping async completion: {status}");
                continue;
            }
            woke |= waiting;
        }
        woke
    }

    /// Waits until a task is ready. Returns false when nothing could ever
    /// become ready: no ready tasks, no timers and no outstanding async
    /// handles.
    pub fn blocking_poll(&mut self) -> bool {
        loop {
            if self.has_ready() || self.poll() {
                return true;
            }
            let next_timer = self.timers.peek().map(|Reverse((deadline, _))| *deadline);
            let shared = self.shared.clone();
            let mut queue = shared.queue.lock();
            if !queue.completed.is_empty() {
                continue;
            }
            if queue.outstanding == 0 && next_timer.is_none() {
                return false;
            }
            let limit = Instant::now() + self.settings.max_blocking_wait;
            let deadline = next_timer.map_or(limit, |timer| timer.min(limit));
            shared.wake.wait_until(&mut queue, deadline);
        }
    }

    // ── Collection ────────────────────────────────────────────────────

    /// Calls `visit` for every cell held by a task. Promise values are
    /// not roots; they stay alive through their futures.
    pub fn visit_roots(&self, visit: &mut dyn FnMut(&DataCell)) {
        for task in self.tasks.values() {
            for cell in task.coro.cells() {
                visit(cell);
            }
        }
    }

    /// Removes every resolved promise. Returns the values of those bound
    /// to a future, which the caller stores into the future.
    pub fn drain_resolved(&mut self) -> Vec<(RefHandle, DataCell)> {
        let mut settled = Vec::new();
        self.promises.retain(|_, promise| match &promise.state {
            PromiseState::Pending(_) => true,
            PromiseState::Resolved(value) => {
                if let Some(future) = promise.future {
                    settled.push((future, value.clone()));
                }
                false
            }
        });
        settled
    }

    /// Drops pending promises nobody waits on whose future is gone.
    /// Returns how many were dropped.
    pub fn prune_promises(&mut self, is_live: impl Fn(RefHandle) -> bool) -> usize {
        let before = self.promises.len();
        self.promises.retain(|_, promise| match &promise.state {
            PromiseState::Pending(waiters) => {
                !waiters.is_empty() || promise.future.is_none_or(|future| is_live(future))
            }
            PromiseState::Resolved(_) => true,
        });
        before - self.promises.len()
    }
}

impl Default for SystemScheduler {
    fn default() -> Self {
        Self::new(SchedulerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HeapManager, StringRef};

    fn mk_worker(scheduler: &mut SystemScheduler) -> TaskId {
        scheduler.create_task(StackfulCoroutine::new())
    }

    #[test]
    fn ready_tasks_rotate() {
        let mut scheduler = SystemScheduler::default();
        let main = scheduler.main_task();
        let worker = mk_worker(&mut scheduler);

        assert_eq!(scheduler.select_next_ready(), Some(worker));
        assert_eq!(scheduler.task(main).unwrap().state(), TaskState::Ready);
        assert_eq!(scheduler.select_next_ready(), Some(main));
        assert_eq!(scheduler.select_next_ready(), Some(worker));
    }

    #[test]
    fn awaiting_a_pending_promise_suspends() {
        let mut scheduler = SystemScheduler::default();
        let main = scheduler.main_task();
        let promise = scheduler.create_promise();

        scheduler.await_promise(promise).unwrap();
        assert_eq!(scheduler.current_task_id(), None);
        assert_eq!(
            scheduler.task(main).unwrap().state(),
            TaskState::Suspended(WaitReason::Promise(promise))
        );

        scheduler.resolve_promise(promise, DataCell::for_i64(5)).unwrap();
        assert_eq!(scheduler.select_next_ready(), Some(main));
        assert_eq!(
            scheduler.current_coro().unwrap().data(),
            &[DataCell::I64(5)]
        );
        assert!(scheduler.resolve_promise(promise, DataCell::Nil).is_err());

        scheduler.await_promise(promise).unwrap();
        assert_eq!(scheduler.current_coro().unwrap().data_depth(), 2);
    }

    #[test]
    fn terminated_workers_resolve_their_completion() {
        let mut scheduler = SystemScheduler::default();
        let worker = mk_worker(&mut scheduler);
        let completion = scheduler.task(worker).unwrap().completion().unwrap();
        scheduler.terminate_task(worker, DataCell::for_bool(true)).unwrap();
        assert!(scheduler.task(worker).is_none());
        assert_eq!(scheduler.promise_value(completion), Some(&DataCell::Bool(true)));
        assert_eq!(scheduler.select_next_ready(), Some(scheduler.main_task()));
    }

    #[test]
    fn resolved_promises_are_drained() {
        let mut scheduler = SystemScheduler::default();
        let mut heap = HeapManager::default();
        let future = heap.allocate(StringRef::owned("future".into()));
        let bound = scheduler.create_promise();
        let unbound = scheduler.create_promise();
        let pending = scheduler.create_promise();
        scheduler.bind_future(bound, future).unwrap();
        scheduler.bind_future(pending, future).unwrap();
        scheduler.resolve_promise(bound, DataCell::for_i64(1)).unwrap();
        scheduler.resolve_promise(unbound, DataCell::for_i64(2)).unwrap();

        let settled = scheduler.drain_resolved();
        assert_eq!(settled, vec![(future, DataCell::I64(1))]);
        assert_eq!(scheduler.promise_count(), 1);
        assert!(scheduler.promise_value(bound).is_none());

        assert_eq!(scheduler.prune_promises(|_| true), 0);
        assert_eq!(scheduler.prune_promises(|_| false), 1);
        assert_eq!(scheduler.promise_count(), 0);
    }

    #[test]
    fn awaited_promises_survive_pruning() {
        let mut scheduler = SystemScheduler::default();
        let mut heap = HeapManager::default();
        let future = heap.allocate(StringRef::owned("future".into()));
        let promise = scheduler.create_promise();
        scheduler.bind_future(promise, future).unwrap();
        scheduler.await_promise(promise).unwrap();

        assert_eq!(scheduler.prune_promises(|_| false), 0);
        scheduler.resolve_promise(promise, DataCell::Nil).unwrap();
        assert_eq!(scheduler.select_next_ready(), Some(scheduler.main_task()));
    }

    #[test]
    fn timers_wake_with_nil() {
        let mut scheduler = SystemScheduler::default();
        scheduler.register_timer(Duration::ZERO).unwrap();
        assert_eq!(scheduler.current_task_id(), None);
        assert!(scheduler.blocking_poll());
        assert_eq!(scheduler.select_next_ready(), Some(scheduler.main_task()));
        assert_eq!(scheduler.current_coro().unwrap().data(), &[DataCell::Nil]);
    }

    #[test]
    fn async_handles_complete_from_other_threads() {
        let mut scheduler = SystemScheduler::default();
        let handle = scheduler.async_handle();
        let promise = handle.promise();
        scheduler.await_promise(promise).unwrap();

        let worker = std::thread::spawn(move || handle.complete(DataCell::for_i64(42)));
        assert!(scheduler.blocking_poll());
        worker.join().unwrap();

        assert_eq!(scheduler.select_next_ready(), Some(scheduler.main_task()));
        assert_eq!(scheduler.current_coro().unwrap().data(), &[DataCell::I64(42)]);
    }

    #[test]
    fn nothing_pending_means_blocking_poll_gives_up() {
        let mut scheduler = SystemScheduler::default();
        let promise = scheduler.create_promise();
        scheduler.await_promise(promise).unwrap();
        assert!(!scheduler.blocking_poll());

        drop(scheduler.async_handle());
        assert!(!scheduler.blocking_poll());
    }
}
