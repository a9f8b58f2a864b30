//! Runtime configuration variables.
//!
//! A [`ConfigVar`] is a named, typed, process-wide setting with a default
//! value and change listeners. The runtime exposes two of them:
//!
//! - [`FIBER_STACK_SIZE`] (`fiber.stack_size`): default fiber stack size in bytes.
//! - [`TCP_CONNECT_TIMEOUT`] (`tcp.connect.timeout`): timeout applied by
//!   [`hook::connect`](crate::hook::connect), in milliseconds.
//!
//! Values can be overridden from the environment with [`load_env`]. The
//! variable name is upper-cased, dots become underscores, and the result is
//! prefixed with `WEFT_`, so `fiber.stack_size` reads `WEFT_FIBER_STACK_SIZE`.

use crate::error::{Error, Result};

use log::{debug, info};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};

use std::fmt::Debug;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

type Listener<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// Default stack size for fibers created without an explicit size.
pub static FIBER_STACK_SIZE: Lazy<ConfigVar<usize>> = Lazy::new(|| {
    ConfigVar::new("fiber.stack_size", 128 * 1024, "fiber stack size in bytes")
});

/// Timeout applied to hooked `connect` calls, in milliseconds.
pub static TCP_CONNECT_TIMEOUT: Lazy<ConfigVar<u64>> = Lazy::new(|| {
    ConfigVar::new(
        "tcp.connect.timeout",
        5000,
        "tcp connect timeout in milliseconds",
    )
});

/// Refreshes every runtime variable from the process environment.
///
/// Unset variables keep their current value.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] on the first variable whose environment
/// value does not parse.
pub fn load_env() -> Result<()> {
    FIBER_STACK_SIZE.load_env()?;
    TCP_CONNECT_TIMEOUT.load_env()?;
    Ok(())
}

/// A named configuration value with change notification.
pub struct ConfigVar<T> {
    name: &'static str,
    description: &'static str,
    value: RwLock<T>,
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
    next_listener: AtomicU64,
}

impl<T> ConfigVar<T>
where
    T: Clone + PartialEq + Debug + FromStr + Send + Sync + 'static,
{
    pub fn new(name: &'static str, default: T, description: &'static str) -> Self {
        Self {
            name,
            description,
            value: RwLock::new(default),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Returns a copy of the current value.
    pub fn get(&self) -> T {
        self.value.read().clone()
    }

    /// Replaces the value and notifies listeners with `(old, new)`.
    ///
    /// Setting the value it already holds is a no-op. Listeners run on the
    /// calling thread and must not register or remove listeners on the same
    /// variable.
    pub fn set(&self, value: T) {
        let old = {
            let mut current = self.value.write();
            if *current == value {
                return;
            }
            std::mem::replace(&mut *current, value.clone())
        };

        info!("config {} changed: {:?} -> {:?}", self.name, old, value);

        for (_, listener) in self.listeners.lock().iter() {
            listener(&old, &value);
        }
    }

    /// Registers a change listener and returns its id.
    pub fn add_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(&T, &T) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.lock().push((id, Box::new(listener)));
        id
    }

    /// Removes a listener. Returns `false` if the id was unknown.
    pub fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Parses `raw` and stores the result.
    pub fn parse_and_set(&self, raw: &str) -> Result<()> {
        let value = raw.trim().parse::<T>().map_err(|_| Error::InvalidConfig {
            name: self.name,
            value: raw.to_owned(),
        })?;
        self.set(value);
        Ok(())
    }

    /// Name of the environment variable that overrides this value.
    pub fn env_key(&self) -> String {
        format!("WEFT_{}", self.name.to_uppercase().replace('.', "_"))
    }

    /// Loads the value from the environment.
    ///
    /// Returns `true` if the variable was present.
    pub fn load_env(&self) -> Result<bool> {
        let key = self.env_key();
        match std::env::var(&key) {
            Ok(raw) => {
                debug!("config {} read from {}", self.name, key);
                self.parse_and_set(&raw)?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn env_key_is_derived_from_the_name() {
        let var = ConfigVar::new("tcp.connect.timeout", 1u64, "");
        assert_eq!(var.env_key(), "WEFT_TCP_CONNECT_TIMEOUT");
    }

    #[test]
    fn set_notifies_only_on_change() {
        let var = ConfigVar::new("test.value", 10u32, "");
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = calls.clone();
        var.add_listener(move |old, new| {
            assert_eq!((*old, *new), (10, 20));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        var.set(20);
        var.set(20);

        assert_eq!(var.get(), 20);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_listener_is_not_called() {
        let var = ConfigVar::new("test.removed", 1i64, "");
        let calls = Arc::new(AtomicUsize::new(0));

        let seen = calls.clone();
        let id = var.add_listener(move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        assert!(var.remove_listener(id));
        assert!(!var.remove_listener(id));

        var.set(2);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn parse_errors_keep_the_old_value() {
        let var = ConfigVar::new("test.parse", 7usize, "");

        let err = var.parse_and_set("seven").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { name: "test.parse", .. }));
        assert_eq!(var.get(), 7);

        var.parse_and_set(" 42 ").unwrap();
        assert_eq!(var.get(), 42);
    }
}
