use std::sync::{Arc, Mutex};

use crate::task::{Task, TaskCtl, TaskHandle};

/// Handle to a registered periodic timer.
pub type TimerHandle = u32;

/// Sentinel for an unassigned timer handle.
pub const INVALID_TIMER: TimerHandle = u32::MAX;

/// Resolution of the timer worker's wakeup loop.
pub const TIMER_TICK_MS: u32 = 100;

type Callback = Box<dyn FnMut() + Send>;

struct TimerRec {
    handle: TimerHandle,
    /// Ticks remaining until the next fire.
    count: u32,
    /// Reload value, in ticks.
    interval: u32,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    timers: Vec<TimerRec>,
    next_handle: TimerHandle,
}

/// A periodic-callback service driven by one dedicated worker thread.
///
/// Timers are created with a millisecond interval (rounded up to the
/// 100 ms tick) and fire repeatedly until destroyed. The registry lock is
/// held across decrement, callback, and reload, so `destroy` from another
/// thread is safe even while a callback is executing.
pub struct TimerService {
    registry: Arc<Mutex<Registry>>,
    worker: TaskHandle,
}

struct TimerWorker {
    registry: Arc<Mutex<Registry>>,
}

impl Task for TimerWorker {
    fn name(&self) -> &'static str {
        "timer"
    }

    fn on_run(&mut self, ctl: &TaskCtl) {
        while !ctl.is_shutdown_requested() {
            std::thread::sleep(std::time::Duration::from_millis(u64::from(TIMER_TICK_MS)));
            let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
            for rec in &mut reg.timers {
                rec.count = rec.count.saturating_sub(1);
                if rec.count == 0 {
                    (rec.callback)();
                    rec.count = rec.interval;
                }
            }
        }
    }
}

impl TimerService {
    pub fn start() -> Self {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let worker = TaskHandle::start(TimerWorker { registry: registry.clone() });
        Self { registry, worker }
    }

    /// Register a periodic timer firing every `interval_ms` milliseconds.
    pub fn create(&self, interval_ms: u32, callback: impl FnMut() + Send + 'static) -> TimerHandle {
        let ticks = (interval_ms / TIMER_TICK_MS).max(1);
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let handle = reg.next_handle;
        reg.next_handle = reg.next_handle.wrapping_add(1);
        reg.timers.push(TimerRec {
            handle,
            count: ticks,
            interval: ticks,
            callback: Box::new(callback),
        });
        handle
    }

    /// Reset a timer's countdown to its full interval.
    pub fn restart(&self, handle: TimerHandle) {
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rec) = reg.timers.iter_mut().find(|r| r.handle == handle) {
            rec.count = rec.interval;
        }
    }

    /// Unregister a timer. Safe to call while its callback runs on the
    /// worker thread.
    pub fn destroy(&self, handle: TimerHandle) {
        let mut reg = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        reg.timers.retain(|r| r.handle != handle);
    }

    pub fn shutdown(&mut self) {
        self.worker.stop();
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
