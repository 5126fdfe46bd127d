mod slidebuf;
mod task;
mod timer;

pub use slidebuf::SlideBuffer;
pub use task::{Task, TaskCtl, TaskHandle, TaskState};
pub use timer::{TimerHandle, TimerService, INVALID_TIMER, TIMER_TICK_MS};
