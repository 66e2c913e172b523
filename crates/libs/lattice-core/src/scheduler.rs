//! Cooperative task scheduler.
//!
//! Single-threaded and run-to-completion: `execute` runs every due task
//! once, without preemption. Callbacks may add or remove other tasks while
//! running; removing the running task itself is deferred until the callback
//! returns, so a task never destroys the frame it is executing in.
//!
//! The owner of the scheduler can also drive it through the
//! `due`/`begin`/`finish` triple when the callback context is the struct
//! the scheduler lives in.

/// Stable identifier for a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskHandle(u64);

/// How often a task repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iterations {
    Forever,
    Count(u32),
}

struct Task<C> {
    handle: TaskHandle,
    interval_ms: u64,
    remaining: Iterations,
    next_due_ms: u64,
    enabled: bool,
    removed: bool,
    callback: Option<Box<dyn FnMut(&mut C)>>,
}

pub struct Scheduler<C> {
    tasks: Vec<Task<C>>,
    next_id: u64,
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self { tasks: Vec::new(), next_id: 1 }
    }

    /// Register a repeating task. The first run is one interval from `now`.
    pub fn add_task(
        &mut self,
        now_ms: u64,
        interval_ms: u64,
        iterations: Iterations,
        callback: Box<dyn FnMut(&mut C)>,
    ) -> TaskHandle {
        let handle = TaskHandle(self.next_id);
        self.next_id += 1;
        self.tasks.push(Task {
            handle,
            interval_ms,
            remaining: iterations,
            next_due_ms: now_ms.saturating_add(interval_ms),
            enabled: true,
            removed: false,
            callback: Some(callback),
        });
        handle
    }

    /// Register a task that fires once after `delay_ms`.
    pub fn add_one_shot(
        &mut self,
        now_ms: u64,
        delay_ms: u64,
        callback: Box<dyn FnMut(&mut C)>,
    ) -> TaskHandle {
        self.add_task(now_ms, delay_ms, Iterations::Count(1), callback)
    }

    /// Remove a task. If the task is currently executing, removal is
    /// deferred until its callback returns.
    pub fn remove(&mut self, handle: TaskHandle) {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.handle == handle) {
            if task.callback.is_none() {
                task.removed = true;
            } else {
                self.tasks.retain(|t| t.handle != handle);
            }
        }
    }

    pub fn set_enabled(&mut self, handle: TaskHandle, enabled: bool) {
        if let Some(task) = self.tasks.iter_mut().find(|t| t.handle == handle) {
            task.enabled = enabled;
        }
    }

    pub fn is_scheduled(&self, handle: TaskHandle) -> bool {
        self.tasks.iter().any(|t| t.handle == handle && !t.removed)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Handles of every task due at `now_ms`.
    pub fn due(&self, now_ms: u64) -> Vec<TaskHandle> {
        self.tasks
            .iter()
            .filter(|t| t.enabled && !t.removed && t.callback.is_some() && t.next_due_ms <= now_ms)
            .map(|t| t.handle)
            .collect()
    }

    /// Take the callback of a due task for execution. Returns `None` when
    /// the task was removed or disabled since `due` was computed.
    pub fn begin(&mut self, handle: TaskHandle) -> Option<Box<dyn FnMut(&mut C)>> {
        let task = self.tasks.iter_mut().find(|t| t.handle == handle)?;
        if task.removed || !task.enabled {
            return None;
        }
        task.callback.take()
    }

    /// Return a callback after execution: reschedule, or retire the task
    /// when its iterations are exhausted or it was removed mid-run.
    pub fn finish(&mut self, handle: TaskHandle, callback: Box<dyn FnMut(&mut C)>, now_ms: u64) {
        let Some(index) = self.tasks.iter().position(|t| t.handle == handle) else {
            return;
        };
        let task = &mut self.tasks[index];
        if task.removed {
            self.tasks.remove(index);
            return;
        }
        task.remaining = match task.remaining {
            Iterations::Forever => Iterations::Forever,
            Iterations::Count(n) => Iterations::Count(n.saturating_sub(1)),
        };
        if task.remaining == Iterations::Count(0) {
            self.tasks.remove(index);
            return;
        }
        // Reschedule from now, not from the previous due time; a starved
        // scheduler must not burst to catch up.
        task.next_due_ms = now_ms.saturating_add(task.interval_ms);
        task.callback = Some(callback);
    }

    /// Run every due task once against an external context.
    pub fn execute(&mut self, now_ms: u64, ctx: &mut C) {
        for handle in self.due(now_ms) {
            if let Some(mut callback) = self.begin(handle) {
                callback(ctx);
                self.finish(handle, callback, now_ms);
            }
        }
    }
}
