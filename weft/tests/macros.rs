use weft::{Fiber, IoManager};

use std::time::{Duration, Instant};

#[weft::test]
fn test_body_runs_in_fiber() {
    assert!(Fiber::in_fiber());
    assert!(IoManager::current().is_some());
}

#[weft::test(threads = 2, name = "macro")]
fn test_options_are_applied() {
    let iom = IoManager::current().unwrap();
    assert_eq!(iom.name(), "macro");
    assert_eq!(iom.thread_ids().len(), 2);
}

#[weft::test(threads = 1)]
fn test_sleep_inside_macro() {
    let start = Instant::now();
    weft::time::sleep(Duration::from_millis(30));
    assert!(start.elapsed() >= Duration::from_millis(29));
}

#[weft::test]
fn test_result_return() -> Result<(), String> {
    match "42".parse::<u32>() {
        Ok(42) => Ok(()),
        other => Err(format!("unexpected parse result: {other:?}")),
    }
}
