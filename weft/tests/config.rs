use weft::config::{ConfigVar, FIBER_STACK_SIZE, TCP_CONNECT_TIMEOUT};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[test]
fn test_runtime_defaults() {
    assert_eq!(FIBER_STACK_SIZE.name(), "fiber.stack_size");
    assert_eq!(TCP_CONNECT_TIMEOUT.name(), "tcp.connect.timeout");
    assert_eq!(FIBER_STACK_SIZE.env_key(), "WEFT_FIBER_STACK_SIZE");
    assert_eq!(TCP_CONNECT_TIMEOUT.env_key(), "WEFT_TCP_CONNECT_TIMEOUT");
}

#[test]
fn test_listener_sees_changes() {
    let var = ConfigVar::new("test.listener", 10u64, "listener test");
    let last = Arc::new(AtomicU64::new(0));

    let l = last.clone();
    let id = var.add_listener(move |old, new| {
        l.store(old * 1000 + new, Ordering::SeqCst);
    });

    var.set(20);
    assert_eq!(last.load(Ordering::SeqCst), 10_020);

    assert!(var.remove_listener(id));
    var.set(30);
    assert_eq!(last.load(Ordering::SeqCst), 10_020);
    assert_eq!(var.get(), 30);
}

#[test]
fn test_load_env_overrides_value() {
    let var = ConfigVar::new("test.env_override", 1u64, "env test");

    unsafe { std::env::set_var("WEFT_TEST_ENV_OVERRIDE", "77") };
    assert!(var.load_env().unwrap());
    assert_eq!(var.get(), 77);

    unsafe { std::env::set_var("WEFT_TEST_ENV_OVERRIDE", "not a number") };
    assert!(var.load_env().is_err());
    assert_eq!(var.get(), 77);

    unsafe { std::env::remove_var("WEFT_TEST_ENV_OVERRIDE") };
    assert!(!var.load_env().unwrap());
}

#[test]
fn test_stack_size_applies_to_new_fibers() {
    let fiber = weft::Fiber::new(|| {
        let buf = [1u8; 64 * 1024];
        assert_eq!(buf.len(), 64 * 1024);
    });

    fiber.resume();
    assert_eq!(fiber.state(), weft::FiberState::Term);
}
