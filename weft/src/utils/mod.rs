//! Small helpers shared by the runtime internals.

mod clock;

pub(crate) use clock::current_ms;
