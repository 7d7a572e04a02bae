use crate::reactor::Reactor;
use lazy_static::lazy_static;
use std::sync::Mutex;

lazy_static! {
    /// Process-wide reactor slot; replaced wholesale on teardown.
    static ref GLOBAL: Mutex<Option<Reactor>> = Mutex::new(None);
}

/// Returns the process-wide reactor, creating it on first use. Repeated
/// calls hand out the same instance until [`stop_global`] discards it.
pub fn global() -> Reactor {
    GLOBAL
        .lock()
        .unwrap()
        .get_or_insert_with(Reactor::default)
        .clone()
}

/// Stops the process-wide reactor, waits for its loop to wind down and
/// discards the instance, so the next [`global`] call produces a fresh one.
/// A no-op when no global reactor exists.
pub fn stop_global() {
    let reactor = GLOBAL.lock().unwrap().take();
    if let Some(reactor) = reactor {
        reactor.stop();
        // wait() refuses to block when this is the loop thread itself.
        reactor.wait();
    }
}
