use crate::fiber::{Fiber, FiberState};
use crate::runtime::context;
use crate::runtime::scheduler::Dispatch;
use crate::runtime::task::Task;

use log::{debug, error};

use std::sync::Arc;
use std::thread;

/// Runs the dispatch loop on the current thread until the scheduler stops.
///
/// The loop:
/// 1. takes the first task this thread may run,
/// 2. resumes it (callbacks run inside a fiber the loop reuses),
/// 3. re-queues it if it yielded `READY`,
/// 4. resumes the idle fiber when nothing was found.
///
/// It returns once the idle fiber has finished, which happens when the
/// scheduler's stop predicate holds.
pub(crate) fn run(dispatch: Arc<dyn Dispatch>) {
    let scheduler = dispatch.scheduler();
    let me = thread::current().id();
    debug!("scheduler {}: dispatch loop running on {:?}", scheduler.name(), me);

    let previous_scheduler = context::enter_scheduler(Some(dispatch.clone()));
    let previous_hook = context::hook_enabled();
    context::set_hook_enabled(true);

    let idle_owner = dispatch.clone();
    let idle_fiber = Fiber::new(move || idle_owner.idle());
    let mut callback_fiber: Option<Arc<Fiber>> = None;

    loop {
        let (task, tickle_others) = scheduler.take_next(me);
        if tickle_others {
            dispatch.tickle();
        }

        match task {
            Some(Task::Fiber(fiber)) => {
                if fiber.state().is_resumable() && fiber.resume() == FiberState::Ready {
                    scheduler.schedule_fiber(fiber);
                }
                scheduler.finish_task();
            }
            Some(Task::Callback(callback)) => {
                let fiber = match callback_fiber.take() {
                    Some(fiber) => {
                        fiber.reset(callback);
                        fiber
                    }
                    None => Fiber::new(callback),
                };

                match fiber.resume() {
                    FiberState::Ready => scheduler.schedule_fiber(fiber),
                    FiberState::Term | FiberState::Except => callback_fiber = Some(fiber),
                    // Parked: whoever holds it now owns the wake-up.
                    _ => {}
                }
                scheduler.finish_task();
            }
            None => {
                match idle_fiber.state() {
                    FiberState::Term => break,
                    FiberState::Except => {
                        error!("scheduler {}: idle fiber panicked", scheduler.name());
                        break;
                    }
                    _ => {}
                }

                scheduler.enter_idle();
                idle_fiber.resume();
                scheduler.leave_idle();
            }
        }
    }

    context::set_hook_enabled(previous_hook);
    context::enter_scheduler(previous_scheduler);

    debug!("scheduler {}: dispatch loop on {:?} exited", scheduler.name(), me);
}
