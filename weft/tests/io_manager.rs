use weft::{Builder, Event, Fiber, IoManager};

use parking_lot::Mutex;

use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0; 2];
    assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
    (fds[0], fds[1])
}

fn write_byte(fd: RawFd) {
    let byte = 1u8;
    let n = unsafe { libc::write(fd, (&byte as *const u8).cast(), 1) };
    assert_eq!(n, 1);
}

fn close(fds: &[RawFd]) {
    for fd in fds {
        unsafe { libc::close(*fd) };
    }
}

#[test]
fn test_read_event_runs_callback() {
    let iom = Builder::new().threads(2).build().unwrap();
    let (r, w) = pipe();
    let (tx, rx) = mpsc::channel();

    iom.add_event_with(r, Event::READ, move || {
        tx.send(()).unwrap();
    })
    .unwrap();
    assert_eq!(iom.pending_events(), 1);

    write_byte(w);

    rx.recv_timeout(Duration::from_secs(2)).expect("read event never fired");
    iom.stop();

    assert_eq!(iom.pending_events(), 0);
    close(&[r, w]);
}

#[test]
fn test_event_fires_once() {
    let iom = Builder::new().threads(2).build().unwrap();
    let (r, w) = pipe();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    iom.add_event_with(r, Event::READ, move || {
        h.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    write_byte(w);
    thread::sleep(Duration::from_millis(50));
    write_byte(w);

    iom.stop();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    close(&[r, w]);
}

#[test]
fn test_cancel_event_runs_continuation() {
    let iom = Builder::new().threads(1).build().unwrap();
    let (r, w) = pipe();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    iom.add_event_with(r, Event::READ, move || {
        h.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    assert!(iom.cancel_event(r, Event::READ));
    assert!(!iom.cancel_event(r, Event::READ));
    assert_eq!(iom.pending_events(), 0);

    iom.stop();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    close(&[r, w]);
}

#[test]
fn test_del_event_drops_continuation() {
    let iom = Builder::new().threads(1).build().unwrap();
    let (r, w) = pipe();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    iom.add_event_with(r, Event::READ, move || {
        h.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    assert!(iom.del_event(r, Event::READ));
    assert!(!iom.del_event(r, Event::READ));

    write_byte(w);
    iom.stop();

    assert_eq!(hits.load(Ordering::SeqCst), 0);
    close(&[r, w]);
}

#[test]
fn test_cancel_all_runs_every_continuation() {
    let iom = Builder::new().threads(1).build().unwrap();
    let (r, w) = pipe();
    let hits = Arc::new(AtomicUsize::new(0));

    for event in [Event::READ, Event::WRITE] {
        let h = hits.clone();
        iom.add_event_with(r, event, move || {
            h.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    assert_eq!(iom.pending_events(), 2);

    assert!(iom.cancel_all(r));
    assert!(!iom.cancel_all(r));

    iom.stop();

    assert_eq!(hits.load(Ordering::SeqCst), 2);
    close(&[r, w]);
}

#[test]
fn test_duplicate_registration_panics() {
    let iom = Builder::new().threads(1).build().unwrap();
    let (r, w) = pipe();

    iom.add_event_with(r, Event::WRITE, || {}).unwrap();

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = iom.add_event_with(r, Event::WRITE, || {});
    }));
    assert!(outcome.is_err());

    assert!(iom.del_event(r, Event::WRITE));
    iom.stop();
    close(&[r, w]);
}

#[test]
fn test_fiber_parks_until_readable() {
    let iom = Builder::new().threads(2).build().unwrap();
    let (r, w) = pipe();

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(80));
        write_byte(w);
    });

    let start = Instant::now();
    let read = iom.block_on(move || {
        let iom = IoManager::current().expect("no io manager");
        let mut byte = 0u8;

        loop {
            let n = unsafe { libc::read(r, (&mut byte as *mut u8).cast(), 1) };
            if n == 1 {
                return byte;
            }
            iom.add_event(r, Event::READ).unwrap();
            Fiber::yield_to_hold();
        }
    });

    assert_eq!(read, 1);
    assert!(start.elapsed() >= Duration::from_millis(80));

    writer.join().unwrap();
    iom.stop();
    close(&[r, w]);
}

#[test]
fn test_stop_waits_for_pending_event() {
    let iom = Builder::new().threads(2).build().unwrap();
    let (r, w) = pipe();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    iom.add_event_with(r, Event::READ, move || {
        h.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        write_byte(w);
    });

    iom.stop();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    writer.join().unwrap();
    close(&[r, w]);
}

#[test]
fn test_use_caller_io_manager() {
    let iom = Builder::new().threads(1).use_caller(true).build().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));

    let h = hits.clone();
    iom.add_timer(
        30,
        move || {
            h.fetch_add(1, Ordering::SeqCst);
        },
        false,
    );

    iom.stop();

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_fd_beyond_initial_table() {
    let iom = Builder::new().threads(1).build().unwrap();
    let (r, w) = pipe();

    let high = unsafe { libc::fcntl(r, libc::F_DUPFD, 200) };
    assert!(high >= 200);

    let (tx, rx) = mpsc::channel();
    iom.add_event_with(high, Event::READ, move || {
        tx.send(()).unwrap();
    })
    .unwrap();

    write_byte(w);
    rx.recv_timeout(Duration::from_secs(2)).expect("event on high fd never fired");

    iom.stop();
    close(&[high, r, w]);
}

#[test]
fn test_cancel_event_resumes_parked_fiber_without_data() {
    let iom = Builder::new().threads(1).build().unwrap();
    let (r, w) = pipe();
    let (tx, rx) = mpsc::channel();

    iom.schedule(move || {
        let iom = IoManager::current().expect("no io manager");
        iom.add_event(r, Event::READ).unwrap();
        Fiber::yield_to_hold();

        let mut byte = 0u8;
        let n = unsafe { libc::read(r, (&mut byte as *mut u8).cast(), 1) };
        let errno = std::io::Error::last_os_error().raw_os_error();
        tx.send((n, errno)).unwrap();
    });

    let deadline = Instant::now() + Duration::from_secs(2);
    while iom.pending_events() == 0 {
        assert!(Instant::now() < deadline, "fiber never parked");
        thread::sleep(Duration::from_millis(1));
    }
    assert!(iom.cancel_event(r, Event::READ));

    let (n, errno) = rx.recv_timeout(Duration::from_secs(2)).expect("fiber never resumed");
    assert_eq!(n, -1);
    assert_eq!(errno, Some(libc::EAGAIN));

    iom.stop();
    close(&[r, w]);
}

#[test]
fn test_stop_waits_for_recurring_timer_to_cancel_itself() {
    let iom = Builder::new().threads(2).build().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let handle = Arc::new(Mutex::new(None::<weft::Timer>));

    let h = hits.clone();
    let slot = handle.clone();
    let timer = iom.add_timer(
        20,
        move || {
            if h.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                if let Some(timer) = slot.lock().take() {
                    timer.cancel();
                }
            }
        },
        true,
    );
    *handle.lock() = Some(timer);

    let start = Instant::now();
    iom.stop();

    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert!(start.elapsed() >= Duration::from_millis(55));
    assert!(!iom.timers().has_timer());
}
