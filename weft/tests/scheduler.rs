use weft::{Builder, Dispatch, Fiber, Scheduler, Task};

use parking_lot::Mutex;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

#[test]
fn test_runs_every_scheduled_callback() {
    let scheduler = Builder::new().threads(4).name("callbacks").build_scheduler().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    for _ in 0..100 {
        let counter = counter.clone();
        scheduler.schedule(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    scheduler.stop();

    assert_eq!(counter.load(Ordering::SeqCst), 100);
}

#[test]
fn test_uses_several_threads() {
    let scheduler = Builder::new().threads(4).build_scheduler().unwrap();
    let seen = Arc::new(Mutex::new(HashSet::new()));

    for _ in 0..64 {
        let seen = seen.clone();
        scheduler.schedule(move || {
            seen.lock().insert(thread::current().id());
            thread::sleep(Duration::from_millis(2));
        });
    }

    scheduler.stop();

    let seen = seen.lock();
    assert!(seen.len() > 1, "expected work on several threads, got {}", seen.len());
    assert!(seen.len() <= 4);
}

#[test]
fn test_use_caller_drains_on_stop() {
    let scheduler = Scheduler::new(1, true, "caller");
    scheduler.start().unwrap();

    let ran_on = Arc::new(Mutex::new(None));
    let r = ran_on.clone();
    scheduler.schedule(move || {
        *r.lock() = Some(thread::current().id());
    });

    assert!(ran_on.lock().is_none());

    scheduler.stop();

    assert_eq!(*ran_on.lock(), Some(thread::current().id()));
}

#[test]
fn test_schedule_on_pins_to_thread() {
    let scheduler = Builder::new().threads(3).build_scheduler().unwrap();
    let ids = scheduler.thread_ids();
    assert_eq!(ids.len(), 3);

    let target = ids[1];
    let ran_on = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..10 {
        let ran_on = ran_on.clone();
        scheduler.schedule_on(
            Task::callback(move || {
                ran_on.lock().push(thread::current().id());
            }),
            target,
        );
    }

    scheduler.stop();

    let ran_on = ran_on.lock();
    assert_eq!(ran_on.len(), 10);
    assert!(ran_on.iter().all(|id| *id == target));
}

#[test]
fn test_ready_fibers_are_requeued() {
    let scheduler = Builder::new().threads(2).build_scheduler().unwrap();
    let rounds = Arc::new(AtomicUsize::new(0));

    let r = rounds.clone();
    scheduler.schedule(move || {
        for _ in 0..5 {
            r.fetch_add(1, Ordering::SeqCst);
            Fiber::yield_to_ready();
        }
    });

    scheduler.stop();

    assert_eq!(rounds.load(Ordering::SeqCst), 5);
}

#[test]
fn test_yield_interleaves_on_one_thread() {
    let scheduler = Scheduler::new(1, false, "interleave");
    let log = Arc::new(Mutex::new(Vec::new()));

    for name in ["a", "b"] {
        let log = log.clone();
        scheduler.schedule(move || {
            for i in 0..3 {
                log.lock().push(format!("{name}{i}"));
                weft::yield_now();
            }
        });
    }

    scheduler.start().unwrap();
    scheduler.stop();

    let log = log.lock();
    assert_eq!(*log, ["a0", "b0", "a1", "b1", "a2", "b2"]);
}

#[test]
fn test_schedule_existing_fiber() {
    let scheduler = Builder::new().threads(2).build_scheduler().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    let fiber = Fiber::new(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    scheduler.schedule_fiber(fiber.clone());

    scheduler.stop();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(fiber.state(), weft::FiberState::Term);
}

#[test]
fn test_schedule_batch() {
    let scheduler = Builder::new().threads(2).build_scheduler().unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    scheduler.schedule_batch((0..20).map(|_| {
        let counter = counter.clone();
        Task::callback(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }));

    scheduler.stop();

    assert_eq!(counter.load(Ordering::SeqCst), 20);
}

#[test]
fn test_block_on_returns_value() {
    let scheduler = Builder::new().threads(2).build_scheduler().unwrap();

    let value = scheduler.block_on(|| {
        assert!(Fiber::in_fiber());
        6 * 7
    });

    assert_eq!(value, 42);
    scheduler.stop();
}

#[test]
fn test_panicking_task_does_not_kill_worker() {
    let scheduler = Builder::new().threads(1).build_scheduler().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    scheduler.schedule(|| panic!("task failure"));
    let h = hits.clone();
    scheduler.schedule(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });

    scheduler.stop();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_current_scheduler_inside_task() {
    let scheduler = Builder::new().threads(1).name("current").build_scheduler().unwrap();

    let name = scheduler.block_on(|| {
        Scheduler::current()
            .map(|current| current.scheduler().name().to_owned())
            .unwrap_or_default()
    });

    assert_eq!(name, "current");
    assert!(Scheduler::current().is_none());
    scheduler.stop();
}

#[test]
fn test_stop_without_work() {
    let scheduler = Builder::new().threads(2).build_scheduler().unwrap();
    scheduler.stop();

    assert_eq!(scheduler.active_threads(), 0);
}
