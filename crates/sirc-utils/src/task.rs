use std::{
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use tracing::{info, span, Level};

/// Execution phase of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Starting,
            2 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// A unit of work performed by a dedicated thread.
///
/// The lifecycle has three phases: `on_start` for one-time setup (returning
/// false skips the run phase), `on_run` for the main loop, and `on_exit` for
/// cleanup. `on_exit` runs whenever the thread was launched, even if
/// `on_start` failed. `on_run` implementations must poll
/// [`TaskCtl::is_shutdown_requested`] and return promptly once it is set.
pub trait Task: Send + 'static {
    fn name(&self) -> &'static str;

    fn on_start(&mut self, _ctl: &TaskCtl) -> bool {
        true
    }

    fn on_run(&mut self, ctl: &TaskCtl);

    fn on_exit(&mut self) {}
}

/// Shared controls handed to a running task.
///
/// Cloneable; the task may keep a copy to request its own shutdown.
#[derive(Clone)]
pub struct TaskCtl {
    shutdown: Arc<AtomicBool>,
}

impl TaskCtl {
    fn new() -> Self {
        Self { shutdown: Arc::new(AtomicBool::new(false)) }
    }

    #[inline]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Begin the shutdown process from inside (or outside) the task.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// Owner handle for a spawned [`Task`].
pub struct TaskHandle {
    name: &'static str,
    state: Arc<AtomicU8>,
    ctl: TaskCtl,
    thread: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Launch `task` on its own thread.
    ///
    /// All signals are blocked in the worker so delivery stays confined to
    /// the main thread.
    pub fn start<T: Task>(mut task: T) -> Self {
        let name = task.name();
        let state = Arc::new(AtomicU8::new(TaskState::Starting as u8));
        let ctl = TaskCtl::new();

        let thread_state = state.clone();
        let thread_ctl = ctl.clone();
        let thread = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _span = span!(Level::INFO, "", task = name).entered();
                block_all_signals();

                if task.on_start(&thread_ctl) {
                    thread_state.store(TaskState::Running as u8, Ordering::Release);
                    info!("task running");
                    task.on_run(&thread_ctl);
                } else {
                    info!("task init failed, skipping run phase");
                }
                task.on_exit();
                thread_state.store(TaskState::Stopped as u8, Ordering::Release);
                info!("task exited");
            })
            .expect("spawn task thread");

        Self { name, state, ctl, thread: Some(thread) }
    }

    #[inline]
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_shutdown_requested(&self) -> bool {
        self.ctl.is_shutdown_requested()
    }

    pub fn ctl(&self) -> TaskCtl {
        self.ctl.clone()
    }

    /// Request shutdown and join the worker. Returns false if the task had
    /// already stopped.
    pub fn stop(&mut self) -> bool {
        let Some(thread) = self.thread.take() else {
            return false;
        };
        self.ctl.request_shutdown();
        if thread.join().is_err() {
            tracing::error!(task = self.name, "task thread panicked");
        }
        self.state.store(TaskState::Stopped as u8, Ordering::Release);
        true
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(unix)]
fn block_all_signals() {
    unsafe {
        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigfillset(&mut set);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

#[cfg(not(unix))]
fn block_all_signals() {}
