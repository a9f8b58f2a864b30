use crate::fiber::Fiber;

/// Yields the current fiber back to its scheduler.
///
/// The fiber goes to the back of the run queue, letting other tasks make
/// progress before it continues. Outside a fiber this only yields the
/// thread.
///
/// # Examples
///
/// ```rust,ignore
/// iom.schedule(|| {
///     for chunk in work {
///         process(chunk);
///         weft::yield_now();
///     }
/// });
/// ```
pub fn yield_now() {
    if Fiber::in_fiber() {
        Fiber::yield_to_ready();
    } else {
        std::thread::yield_now();
    }
}
