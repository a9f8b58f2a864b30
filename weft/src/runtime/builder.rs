use crate::reactor::IoManager;
use crate::runtime::scheduler::Scheduler;

use std::io;
use std::sync::Arc;
use std::thread;

/// Builder for configuring and creating a scheduler.
///
/// `Builder` collects the pool parameters and produces either an
/// [`IoManager`] (the usual choice) or a plain [`Scheduler`] without I/O
/// support.
///
/// # Examples
///
/// ```rust,ignore
/// let iom = Builder::new()
///     .threads(4)
///     .name("server")
///     .build()?;
/// ```
pub struct Builder {
    /// Threads running tasks, the caller included when it participates.
    threads: usize,

    /// Whether the building thread takes part in execution.
    use_caller: bool,

    /// Prefix of worker thread names.
    name: String,
}

impl Builder {
    /// Creates a new `Builder` with default configuration.
    ///
    /// By default, the number of threads is set to the number of available
    /// logical CPUs, falling back to `1` if unavailable, and the caller does
    /// not participate.
    pub fn new() -> Self {
        let threads = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            threads,
            use_caller: false,
            name: String::from("weft"),
        }
    }

    /// Sets the number of threads.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn threads(mut self, n: usize) -> Self {
        assert!(n > 0, "threads must be > 0");

        self.threads = n;
        self
    }

    /// Lets the building thread count as one of the threads.
    ///
    /// That thread only runs tasks once it calls `stop`, which drains the
    /// queue on it before returning.
    pub fn use_caller(mut self, use_caller: bool) -> Self {
        self.use_caller = use_caller;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Builds and starts an [`IoManager`].
    pub fn build(self) -> io::Result<Arc<IoManager>> {
        IoManager::new(self.threads, self.use_caller, self.name)
    }

    /// Builds and starts a plain [`Scheduler`].
    pub fn build_scheduler(self) -> io::Result<Arc<Scheduler>> {
        let scheduler = Scheduler::new(self.threads, self.use_caller, self.name);
        scheduler.start()?;
        Ok(scheduler)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}
